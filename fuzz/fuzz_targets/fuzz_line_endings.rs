//! Fuzz target: streaming line-ending normalization.
//!
//! Splits the input at an arbitrary point and checks that the chunked
//! result matches the one-shot result and never contains a carriage return.

#![no_main]

use libfuzzer_sys::fuzz_target;
use vmrunner_console::{normalize_line_endings, LineEndingNormalizer};

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let whole = normalize_line_endings(rest);
    assert!(!whole.contains(&b'\r'));

    let at = usize::from(split) % (rest.len() + 1);
    let mut normalizer = LineEndingNormalizer::default();
    let mut chunked = Vec::new();
    normalizer.push(&rest[..at], &mut chunked);
    normalizer.push(&rest[at..], &mut chunked);
    assert_eq!(whole, chunked);
});
