//! Structured fuzzing for the directive parser and organizer.
//!
//! Generates mostly well-formed directive streams with the `arbitrary` crate
//! so that dependency resolution and ordering see interesting graphs.
//!
//! Run with:
//! ```bash
//! cargo +nightly fuzz run fuzz_directive_structured
//! ```

#![no_main]

use arbitrary::Arbitrary;
use fsql_migrate::{DependencyGraph, SourceFile, organize_migrations, parse_sources};
use libfuzzer_sys::fuzz_target;

const NAMES: [&str; 6] = ["a", "b", "c", "core", "users", "idx"];

/// A generated directive line.
#[derive(Debug, Arbitrary)]
enum FuzzLine {
    StartMigration(u8),
    EndMigration,
    StartGroup(u8),
    EndGroup,
    Dependency(FuzzRef),
    GroupDependency(FuzzRef),
    Tags { concurrent: bool, transactional: bool },
    Description(String),
    Sql(String),
}

/// A generated dependency reference.
#[derive(Debug, Arbitrary)]
enum FuzzRef {
    Bare(u8),
    Relative { file: u8, target: Option<u8> },
    Absolute(u8),
    Chain(u8, u8, u8),
}

fn name(index: u8) -> &'static str {
    NAMES[index as usize % NAMES.len()]
}

fn file(index: u8) -> String {
    format!("{:03}-f.sql", index % 3 + 1)
}

impl FuzzRef {
    fn render(&self) -> String {
        match self {
            Self::Bare(n) => name(*n).to_string(),
            Self::Relative { file: f, target } => match target {
                Some(t) => format!("::./{}:{}", file(*f), name(*t)),
                None => format!("::./{}", file(*f)),
            },
            Self::Absolute(f) => format!("/{}", file(*f)),
            Self::Chain(f, g, m) => format!("::./{}::{}::{}", file(*f), name(*g), name(*m)),
        }
    }
}

impl FuzzLine {
    fn render(&self) -> String {
        match self {
            Self::StartMigration(n) => format!("-- +migration: {}", name(*n)),
            Self::EndMigration => "-- +endmigration".to_string(),
            Self::StartGroup(n) => format!("-- +group: {}", name(*n)),
            Self::EndGroup => "-- +endgroup".to_string(),
            Self::Dependency(r) => format!("-- +dependency: {}", r.render()),
            Self::GroupDependency(r) => format!("-- +groupdependency: {}", r.render()),
            Self::Tags {
                concurrent,
                transactional,
            } => {
                let mut tags = Vec::new();
                if *concurrent {
                    tags.push("concurrent");
                }
                if *transactional {
                    tags.push("transactional");
                }
                format!("-- +tags: {}", tags.join(", "))
            }
            Self::Description(text) => format!("--+ {}", text.replace('\n', " ")),
            Self::Sql(text) => format!("SELECT '{}';", text.replace(['\n', '\''], " ")),
        }
    }
}

fuzz_target!(|files: Vec<Vec<FuzzLine>>| {
    let sources: Vec<SourceFile> = files
        .iter()
        .take(3)
        .enumerate()
        .map(|(i, lines)| {
            let content: Vec<String> = lines.iter().map(FuzzLine::render).collect();
            SourceFile::new(format!("m/{}", file(i as u8)), content.join("\n"))
        })
        .collect();

    if let Ok(root) = parse_sources(&sources) {
        let graph = DependencyGraph::build(&root);
        if let Ok(ordered) = organize_migrations(&graph, &root) {
            assert_eq!(ordered.len(), root.migration_count());
        }
    }
});
