#![no_main]

use instalog_core::Event;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    // Anything that parses must survive a second round unchanged.
    if let Ok(event) = Event::deserialize(line) {
        let encoded = event.serialize().expect("parsed event must serialize");
        let again = Event::deserialize(&encoded).expect("serialized event must parse");
        assert_eq!(event, again);
    }
});
