#![no_main]

use genexpr_decompiler::CodeArtifact;
use genexpr_decompiler::decoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut artifact = CodeArtifact::new("<genexpr>", data.to_vec());
    artifact.varnames = vec![".0".to_string(), "x".to_string()];
    artifact.names = vec!["a".to_string()];

    if let Ok(instructions) = decoder::decode(&artifact) {
        // Property: instructions tile the code exactly
        let mut offset = 0;
        for instr in &instructions {
            assert_eq!(instr.offset, offset);
            assert!(instr.size > 0);
            offset = instr.next_offset();
        }
        assert_eq!(offset, data.len());

        assert!(decoder::disassemble(&artifact).is_ok());
    }
});
