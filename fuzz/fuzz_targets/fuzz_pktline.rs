//! Fuzz target for pkt-line framing.
//!
//! Every packet the reader accepts must re-encode to the bytes it came from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = cairn_git::PktLineReader::new(Cursor::new(data));
    let mut consumed = 0usize;

    loop {
        match reader.read() {
            Ok(Some(pkt)) => {
                let encoded = pkt.encode().expect("accepted packet must re-encode");
                let original = &data[consumed..consumed + encoded.len()];
                // Length digits may arrive in either case.
                assert!(original[..4].eq_ignore_ascii_case(&encoded[..4]));
                assert_eq!(&original[4..], &encoded[4..]);
                consumed += encoded.len();
            }
            Ok(None) | Err(_) => break,
        }
    }
});
