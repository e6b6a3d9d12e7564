#![no_main]

use genexpr_decompiler::parser::{Lexer, TokenKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        let mut lexer = Lexer::new(source);
        let mut count = 0;
        loop {
            // Errors end the stream; panics are the failure we look for
            let Ok(token) = lexer.next_token() else {
                break;
            };
            assert!(token.span.start.offset <= token.span.end.offset);
            assert!(token.span.end.offset <= source.len());
            if token.kind == TokenKind::Eof {
                break;
            }

            count += 1;
            assert!(count <= source.len(), "Lexer made no progress");
        }
    }
});
