//! Built-in Instalog plugins.
//!
//! | module | kind |
//! |--------|------|
//! | `input_log_file` | input: JSON lines appended to a file |
//! | `input_socket` | input: batches from another node's `output_socket` |
//! | `output_file` | output: JSON lines plus attachment copies in a directory |
//! | `output_socket` | output: batches to another node's `input_socket` |
//! | `buffer_simple_file` | buffer: [`SimpleFileBuffer`](instalog_buffer::SimpleFileBuffer) |
//! | `buffer_priority_file` | buffer: [`PriorityFileBuffer`](instalog_buffer::PriorityFileBuffer) |

pub mod buffer_file;
pub mod input_log_file;
pub mod input_socket;
pub mod output_file;
pub mod output_socket;
pub mod wire;

use instalog_core::plugin::PluginRegistry;

/// Registry holding every built-in module.
pub fn builtin_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(input_log_file::MODULE, input_log_file::FACTORY);
    registry.register(input_socket::MODULE, input_socket::FACTORY);
    registry.register(output_file::MODULE, output_file::FACTORY);
    registry.register(output_socket::MODULE, output_socket::FACTORY);
    registry.register(buffer_file::SIMPLE_MODULE, buffer_file::SIMPLE_FACTORY);
    registry.register(buffer_file::PRIORITY_MODULE, buffer_file::PRIORITY_FACTORY);
    registry
}
