//! End-to-end pipeline benchmarks: input → transforms → output.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use std::path::Path;
use std::sync::Arc;

use convert_core::options::{ConversionOptions, OptionSet};
use convert_core::pipeline::{Pipeline, PipelineBuilder};
use convert_core::registry::PluginRegistry;

/// Generate an HTML file with N chapters.
fn generate_html(num_chapters: usize) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head><title>Benchmark</title></head>\n<body>\n",
    );
    for i in 0..num_chapters {
        html.push_str(&format!(
            "<h1>Chapter {}</h1>\n\
             <p>Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod tempor \
             incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud \
             exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat.</p>\n\
             <p>Duis aute irure dolor in reprehenderit in voluptate velit esse cillum dolore \
             eu fugiat nulla pariatur. Excepteur sint occaecat cupidatat non proident, sunt in \
             culpa qui officia deserunt mollit anim id est laborum.</p>\n",
            i
        ));
    }
    html.push_str("</body>\n</html>\n");
    html
}

/// Generate a plain text file with N paragraphs.
fn generate_txt(num_paragraphs: usize) -> String {
    let mut txt = String::new();
    for i in 0..num_paragraphs {
        txt.push_str(&format!(
            "Chapter {}\n\n\
             Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod tempor \
             incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud \
             exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat.\n\n",
            i
        ));
    }
    txt
}

fn pipeline() -> Pipeline {
    let mut registry = PluginRegistry::new();
    registry
        .register_input(convert_input_html::HtmlInputPlugin)
        .register_input(convert_input_txt::TxtInputPlugin)
        .register_input(convert_input_epub::EpubInputPlugin)
        .register_output(convert_output_epub::EpubOutputPlugin)
        .register_output(convert_output_oeb::OebOutputPlugin);
    PipelineBuilder::new()
        .registry(Arc::new(registry))
        .transforms(convert_transforms::standard_transforms())
        .build()
        .unwrap()
}

fn bench_conversion(c: &mut Criterion, group_name: &str, ext: &str, generate: fn(usize) -> String) {
    let mut group = c.benchmark_group(group_name);
    group.sample_size(10);

    let pipeline = pipeline();
    let dir = tempfile::tempdir().unwrap();
    let options = OptionSet::new(ConversionOptions::default());

    for n in [10, 100] {
        let input_path = dir.path().join(format!("bench_input_{}.{}", n, ext));
        std::fs::write(&input_path, generate(n)).unwrap();
        let output_path = dir.path().join(format!("bench_output_{}.epub", n));

        group.bench_function(format!("{}_chapters", n), |b| {
            b.iter(|| {
                pipeline
                    .run(black_box(input_path.as_path()), &output_path, &options)
                    .unwrap();
            });
        });
    }

    group.finish();
}

fn bench_html_to_epub(c: &mut Criterion) {
    bench_conversion(c, "E2E_HTML_to_EPUB", "html", generate_html);
}

fn bench_txt_to_epub(c: &mut Criterion) {
    bench_conversion(c, "E2E_TXT_to_EPUB", "txt", generate_txt);
}

/// EPUB back out to an OEB directory, the identity path through the IR.
fn bench_epub_to_oeb(c: &mut Criterion) {
    let mut group = c.benchmark_group("E2E_EPUB_to_OEB");
    group.sample_size(10);

    let pipeline = pipeline();
    let dir = tempfile::tempdir().unwrap();
    let options = OptionSet::new(ConversionOptions::default());
    let html = dir.path().join("source.html");
    std::fs::write(&html, generate_html(50)).unwrap();
    let epub = dir.path().join("source.epub");
    pipeline.run(&html, &epub, &options).unwrap();
    let out: &Path = &dir.path().join("oeb");

    group.bench_function("50_chapters", |b| {
        b.iter(|| pipeline.run(black_box(epub.as_path()), out, &options).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_html_to_epub, bench_txt_to_epub, bench_epub_to_oeb);
criterion_main!(benches);
