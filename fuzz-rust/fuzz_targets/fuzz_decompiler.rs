#![no_main]

use genexpr_decompiler::{CodeArtifact, Constant, decompile};
use libfuzzer_sys::fuzz_target;

fn raw_artifact(data: &[u8]) -> CodeArtifact {
    let mut artifact = CodeArtifact::new("<genexpr>", data.to_vec());
    artifact.varnames = vec![".0".to_string(), "x".to_string(), "y".to_string()];
    artifact.names = vec!["a".to_string(), "b".to_string()];
    artifact.free_vars = vec!["z".to_string()];
    artifact.constants.add(Constant::None);
    artifact.constants.add(Constant::Int(1));
    artifact.constants.add(Constant::Tuple(vec![Constant::Int(1), Constant::Str("s".into())]));
    artifact
}

fuzz_target!(|data: &[u8]| {
    // Decoding or decompiling may fail, but must never panic or loop
    let artifact = raw_artifact(data);
    assert_eq!(decompile(&artifact), decompile(&artifact));

    if let Ok(artifact) = CodeArtifact::from_proto_bytes(data) {
        assert_eq!(decompile(&artifact), decompile(&artifact));
    }
});
