//! Fuzz target for page token parsing.
//!
//! Page tokens come straight from clients, so `PageCursor::load` must never
//! panic, and anything it accepts must dump back to an equivalent cursor.

#![no_main]

use libfuzzer_sys::fuzz_target;
use trtl_replica::cursor::PageCursor;

fuzz_target!(|token: &str| {
    if let Ok(cursor) = PageCursor::load(token) {
        let again = cursor.dump().expect("loaded cursor must dump");
        assert_eq!(PageCursor::load(&again).expect("dumped token must load"), cursor);
    }
});
