#![no_main]
use libfuzzer_sys::fuzz_target;
use lilypad::modules::client::{read_message, write_message, Request, Response};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes on the wire must never panic the reader
    let _ = read_message::<_, Response>(&mut Cursor::new(data));

    if let Ok(req) = read_message::<_, Request>(&mut Cursor::new(data)) {
        let mut buf = Vec::new();
        if write_message(&mut buf, &req).is_ok() {
            let again: Request = read_message(&mut Cursor::new(&buf)).unwrap();
            assert_eq!(again, req);
        }
    }
});
