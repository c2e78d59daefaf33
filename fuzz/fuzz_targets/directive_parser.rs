//! Fuzz target for the directive parser.
//!
//! Feeds arbitrary text to the parser and, when it parses, through the
//! resolver and organizer.
//!
//! Run with:
//! ```bash
//! cargo +nightly fuzz run fuzz_directive_parser
//! ```

#![no_main]

use fsql_migrate::{DependencyGraph, SourceFile, organize_migrations, parse_sources};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Errors are fine, panics are not
        if let Ok(root) = parse_sources(&[SourceFile::new("fuzz/001-input.sql", input)]) {
            let graph = DependencyGraph::build(&root);
            let _ = organize_migrations(&graph, &root);
        }
    }
});
