//! Benchmarks for core container operations.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use convert_core::book::{BookDocument, ManifestData, TocEntry};
use convert_core::dom::Document;

fn chapter(i: usize, links: usize) -> String {
    let mut body = String::new();
    for j in 0..links {
        body.push_str(&format!(
            "<p>Paragraph {j} <a href=\"chapter{}.xhtml#s{j}\">next</a></p>",
            (i + 1) % 100
        ));
    }
    format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><link rel=\"stylesheet\" href=\"style.css\"/></head><body>{body}</body></html>"
    )
}

fn book_with_chapters(n: usize) -> BookDocument {
    let mut book = BookDocument::new();
    book.add_item(
        "style.css",
        "text/css",
        ManifestData::binary(b"p { margin: 0 }".to_vec()),
    )
    .unwrap();
    for i in 0..n {
        let href = format!("chapter{}.xhtml", i);
        book.add_item(
            &href,
            "application/xhtml+xml",
            ManifestData::binary(chapter(i, 20).into_bytes()),
        )
        .unwrap();
        book.add_to_spine(&href, true).unwrap();
    }
    book
}

fn bench_manifest_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("Manifest");

    group.bench_function("add_1000_items", |b| {
        b.iter(|| {
            let mut book = BookDocument::new();
            for i in 0..1000 {
                let href = format!("content/item{}.xhtml", i);
                book.add_item(&href, "application/xhtml+xml", ManifestData::Empty)
                    .unwrap();
            }
            black_box(&book);
        })
    });

    group.bench_function("lookup_by_href_1000_items", |b| {
        let mut book = BookDocument::new();
        for i in 0..1000 {
            let href = format!("content/item{}.xhtml", i);
            book.add_item(&href, "application/xhtml+xml", ManifestData::Empty)
                .unwrap();
        }
        b.iter(|| {
            for i in 0..1000 {
                let href = format!("content/item{}.xhtml", i);
                black_box(book.item(&href));
            }
        })
    });

    group.bench_function("parse_all_100_chapters", |b| {
        b.iter(|| {
            let mut book = book_with_chapters(100);
            book.parse_all().unwrap();
            black_box(&book);
        })
    });

    group.bench_function("rename_item_100_chapters", |b| {
        let mut book = book_with_chapters(100);
        book.parse_all().unwrap();
        b.iter(|| {
            let mut copy = book.clone();
            copy.rename_item("chapter50.xhtml", "text/renamed.xhtml").unwrap();
            black_box(&copy);
        })
    });

    group.bench_function("snapshot_and_mutate_one", |b| {
        let mut book = book_with_chapters(100);
        book.parse_all().unwrap();
        b.iter(|| {
            let mut copy = book.clone();
            let doc = copy.xhtml_mut("chapter0.xhtml").unwrap();
            let root = doc.root();
            black_box(doc.children(root).len());
        })
    });

    group.finish();
}

fn bench_dom(c: &mut Criterion) {
    let source = chapter(0, 500);
    c.bench_function("parse_xhtml_500_paragraphs", |b| {
        b.iter(|| black_box(Document::parse(&source).unwrap()))
    });
}

fn bench_toc(c: &mut Criterion) {
    c.bench_function("rationalize_play_orders_400", |b| {
        let mut book = BookDocument::new();
        for i in 0..100 {
            let mut entry = TocEntry::new(format!("Chapter {}", i), format!("chapter{}.xhtml", i));
            for j in 0..3 {
                entry.add_child(TocEntry::new(
                    format!("Section {}.{}", i, j),
                    format!("chapter{}.xhtml#sec{}", i, j),
                ));
            }
            book.toc.add(entry);
        }
        b.iter(|| {
            book.toc.rationalize_play_orders();
            black_box(book.toc.count());
        })
    });
}

criterion_group!(benches, bench_manifest_operations, bench_dom, bench_toc);
criterion_main!(benches);
