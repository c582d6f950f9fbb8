#![no_main]

use instalog_buffer::record;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Damaged buffer lines must be rejected, never panic.
    if let Ok(line) = std::str::from_utf8(data) {
        let _ = record::decode(line);
    }
});
