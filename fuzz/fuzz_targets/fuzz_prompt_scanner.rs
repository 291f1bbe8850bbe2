//! Fuzz target: prompt recognition.
//!
//! A match is only ever reported on a `#`/`$` next to a space.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vmrunner_console::PromptScanner;

fuzz_target!(|data: &[u8]| {
    let mut scanner = PromptScanner::new();
    for (i, &byte) in data.iter().enumerate() {
        if scanner.push(byte) {
            assert!(i > 0);
            let pair = [data[i - 1], byte];
            assert!(
                matches!(pair, [b' ', b'#' | b'$'] | [b'#' | b'$', b' ']),
                "unexpected match on {pair:?}"
            );
        }
    }
});
