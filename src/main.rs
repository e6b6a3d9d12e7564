use genexpr_decompiler::parser::{self, CompileOptions};
use genexpr_decompiler::{
    ArtifactKey, CodeArtifact, DecompileCache, DecompileOptions, NoneLiteral, conformance,
    decoder, render,
};
use log::info;
use std::process::ExitCode;

const SHOWCASE: &[&str] = &[
    "(p.name for p in Person if p.age > 20)",
    "(s for s in Student if s.gpa > 3.5 and (s.group.number == 4142 or 'Math' in s.courses))",
    "((o.id, o.total) for o in Order if 10 <= o.total < 100 for i in o.items if i.qty > -1)",
    "(g for g in Group if exists(s for s in g.students if s.age > g.min_age))",
    "(f(x, key=1, *rest, **extra) for x in X if not x.hidden)",
    "(a[1:2, ::3] for a in Matrix)",
    "(s.name if s.active else 'n/a' for s in Student if (s.gpa if s.graded else 0) > 3)",
    "(s for s in Student if s.courses.select(lambda c: c.credits > s.min_credits))",
];

fn print_header(title: &str) {
    println!("\n{}", "=".repeat(80));
    println!("  {}", title);
    println!("{}", "=".repeat(80));
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compile, disassemble and decompile one expression
fn show(source: &str, options: &DecompileOptions) -> bool {
    println!("\nSource: {}", source);

    let artifact = match parser::compile(source) {
        Ok(artifact) => artifact,
        Err(e) => {
            println!("  ✗ Compilation failed:");
            println!("{}", indent(&e.format_with_source("<input>")));
            return false;
        }
    };

    println!("  Bytecode ({} bytes): {}", artifact.code.len(), hex_dump(&artifact.code));
    match decoder::disassemble(&artifact) {
        Ok(listing) => println!("  Disassembly:\n{}", indent(&listing)),
        Err(e) => println!("  ✗ Disassembly failed: {}", e),
    }

    match genexpr_decompiler::decompile_with(&artifact, options) {
        Ok(decompiled) => {
            println!("  ✓ Decompiled: {}", decompiled.root);
            println!("    Structure:  {}", render(&decompiled.root));
            println!(
                "    Externals:  {}",
                decompiled
                    .external_names
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            true
        }
        Err(e) => {
            println!("  ✗ Decompilation failed: {}", e);
            false
        }
    }
}

fn example_peephole(source: &str) {
    print_header("Peephole optimization");
    println!("\nSource: {}", source);
    for peephole in [false, true] {
        let options = CompileOptions::new().with_peephole(peephole);
        match parser::compile_with(source, &options) {
            Ok(artifact) => println!(
                "  peephole={:<5} {:>3} bytes: {}",
                peephole,
                artifact.code.len(),
                hex_dump(&artifact.code)
            ),
            Err(e) => println!("  ✗ {}", e),
        }
    }
}

fn example_transport(source: &str) -> bool {
    print_header("Artifact transport and caching");

    let result = parser::compile(source)
        .map_err(|e| e.to_string())
        .and_then(|artifact| artifact.to_proto_bytes().map_err(|e| e.to_string()))
        .and_then(|bytes| {
            let artifact = CodeArtifact::from_proto_bytes(&bytes).map_err(|e| e.to_string())?;
            Ok((bytes, artifact))
        });

    let (bytes, artifact) = match result {
        Ok(pair) => pair,
        Err(e) => {
            println!("  ✗ {}", e);
            return false;
        }
    };
    println!("\n  Encoded artifact: {} bytes", bytes.len());

    let cache = DecompileCache::with_options(
        DecompileOptions::new().with_none_literal(NoneLiteral::Name),
    );
    for _ in 0..2 {
        match cache.get_or_decompile(ArtifactKey::from_encoded(bytes.clone()), &artifact) {
            Ok(decompiled) => println!("  ✓ {} (cached entries: {})", decompiled.root, cache.len()),
            Err(e) => {
                println!("  ✗ {}", e);
                return false;
            }
        }
    }
    true
}

fn example_conformance() -> bool {
    print_header("Conformance corpus");
    let failures = conformance::check_all(conformance::CORPUS);
    println!(
        "\n  {} of {} cases reconstruct exactly",
        conformance::CORPUS.len() - failures.len(),
        conformance::CORPUS.len()
    );
    for (source, error) in &failures {
        println!("  ✗ {}\n{}", source, indent(&error.to_string()));
    }
    failures.is_empty()
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = DecompileOptions::default();

    let ok = if args.is_empty() {
        info!("running showcase with {} expressions", SHOWCASE.len());
        print_header("Decompiling generator expressions");
        let mut ok = SHOWCASE.iter().fold(true, |ok, source| show(source, &options) && ok);
        example_peephole("(x for x in X if not x.a and x.b in (1, 2))");
        ok &= example_transport(SHOWCASE[0]);
        ok &= example_conformance();
        ok
    } else {
        args.iter().fold(true, |ok, source| show(source, &options) && ok)
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
