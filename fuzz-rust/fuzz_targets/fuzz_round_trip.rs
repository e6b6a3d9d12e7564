#![no_main]

use genexpr_decompiler::conformance::round_trip;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        if source.len() > 4096 {
            return;
        }

        let first = round_trip(source);
        let second = round_trip(source);
        assert_eq!(first.is_ok(), second.is_ok());
        if let (Ok(a), Ok(b)) = (&first, &second) {
            assert_eq!(a, b);
        }

        match first {
            // Repeated filters fold into one condition; every other
            // accepted expression must come back unchanged
            Ok(result) if !source.contains(" if ") => {
                assert_eq!(result.expected, result.actual, "{}", source)
            }
            // Rejected input, or nesting past the decompiler's limit
            _ => {}
        }
    }
});
