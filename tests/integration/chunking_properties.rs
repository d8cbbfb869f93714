//! Chunking invariants over loader output.

use groundwork::config::{ChunkingConfig, LoaderConfig};
use groundwork::{Chunker, LoaderRegistry, StructuralMap};

use crate::support::words;

fn sample_texts() -> Vec<String> {
    vec![
        words("alpha", 1),
        words("beta", 57),
        format!("{}\n\n{}\n", words("gamma", 120), words("delta", 33)),
        "naïve café résumé über straße ".repeat(40),
        format!("{}\u{000C}{}", words("page", 75), words("next", 75)),
    ]
}

#[test]
fn test_fresh_text_reconstructs_document() {
    let configs = [(1, 0), (5, 0), (16, 4), (40, 39), (64, 8), (500, 100)];
    for text in sample_texts() {
        for (window, overlap) in configs {
            let chunker = Chunker::new(ChunkingConfig::new(window, overlap)).unwrap();
            let spans = chunker.split(&text, &StructuralMap::new());

            let rebuilt: String = spans.iter().map(|s| s.fresh_text(&text)).collect();
            assert_eq!(rebuilt, text, "window {window} overlap {overlap}");

            for (i, span) in spans.iter().enumerate() {
                assert_eq!(span.seq as usize, i);
                assert!(chunker.count_tokens(span.text(&text)) <= window);
                if i > 0 {
                    assert_eq!(span.overlap_start, spans[i - 1].end);
                    assert!(span.start <= span.overlap_start);
                }
            }
        }
    }
}

#[test]
fn test_paged_text_window_arithmetic() {
    // 3 pages of 3000 tokens, 1000-token windows stepping by 900
    let text = [words("a", 3000), words("b", 3000), words("c", 3000)].join("\u{000C}");
    let loaders = LoaderRegistry::with_defaults(LoaderConfig::default());
    let loaded = loaders.load(text.as_bytes(), "text/plain").unwrap();
    assert_eq!(loaded.structure.page_at(0), Some(1));

    let chunker = Chunker::new(ChunkingConfig::new(1000, 100)).unwrap();
    assert_eq!(chunker.count_tokens(&loaded.text), 9000);

    let spans = chunker.split(&loaded.text, &loaded.structure);
    assert_eq!(spans.len(), 10);
    assert_eq!(spans.last().unwrap().end, loaded.text.len());
    assert_eq!(
        loaded.structure.page_at(spans.last().unwrap().start),
        Some(3)
    );
}

#[test]
fn test_markdown_structure_keeps_reconstruction() {
    let markdown = format!(
        "# Guide\n\n{}\n\n## Setup\n\n```\n{}\n```\n\n{}\n",
        words("intro", 30),
        words("code", 12),
        words("tail", 30)
    );
    let loaders = LoaderRegistry::with_defaults(LoaderConfig::default());
    let loaded = loaders.load(markdown.as_bytes(), "text/markdown").unwrap();
    let chunker = Chunker::new(ChunkingConfig::new(20, 5)).unwrap();

    let spans: Vec<_> = chunker.spans(&loaded.text, &loaded.structure).collect();
    let rebuilt: String = spans.iter().map(|s| s.fresh_text(&loaded.text)).collect();
    assert_eq!(rebuilt, loaded.text);
}

#[test]
fn test_cursor_resumes_after_span() {
    let text = words("resume", 200);
    let chunker = Chunker::new(ChunkingConfig::new(30, 10)).unwrap();
    let all = chunker.split(&text, &StructuralMap::new());

    let resumed: Vec<_> = chunker
        .spans(&text, &StructuralMap::new())
        .resume_after(&all[2])
        .collect();
    assert_eq!(resumed, all[3..].to_vec());
}
