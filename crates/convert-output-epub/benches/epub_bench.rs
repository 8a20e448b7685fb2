//! Benchmarks for EPUB output plugin.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use convert_core::book::{BookDocument, EbookFormat, ManifestData, TocEntry};
use convert_core::dom::Document;
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, OutputPlugin};
use convert_output_epub::EpubOutputPlugin;

/// Create a book with N chapters and M images.
fn make_book(num_chapters: usize, num_images: usize) -> BookDocument {
    let mut book = BookDocument::new();
    book.uid = Some("urn:uuid:5e1f0c1a-0000-4000-8000-000000000001".to_string());
    book.metadata.set_title("EPUB Benchmark Book");
    book.metadata.add("creator", "Bench Author");
    book.metadata.set("language", "en");

    let css = "body {\n  margin: 1em;\n  font-family: serif;\n}\n\np {\n  text-indent: 1.5em;\n}\n";
    book.add_item(
        "style.css",
        "text/css",
        ManifestData::binary(css.as_bytes().to_vec()),
    )
    .unwrap();

    for i in 0..num_chapters {
        let href = format!("chapter{}.xhtml", i);
        let body = format!(
            "<h1>Chapter {}</h1>\n\
             <p>Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod tempor \
             incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud \
             exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat.</p>\n\
             <p>Duis aute irure dolor in reprehenderit in voluptate velit esse cillum dolore \
             eu fugiat nulla pariatur. Excepteur sint occaecat cupidatat non proident.</p>",
            i
        );
        let xhtml = convert_utils::xml::xhtml11_document(
            &format!("Chapter {}", i),
            "en",
            Some("style.css"),
            &body,
        );
        let doc = Document::parse(&xhtml).unwrap();
        book.add_item(&href, "application/xhtml+xml", ManifestData::xhtml(doc))
            .unwrap();
        book.add_to_spine(&href, true).unwrap();
        book.toc.add(TocEntry::new(format!("Chapter {}", i), &href));
    }

    for i in 0..num_images {
        let href = format!("images/img{}.png", i);
        let img = image::RgbaImage::new(50, 50);
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        book.add_item(&href, "image/png", ManifestData::binary(buf))
            .unwrap();
    }

    book
}

fn bench_epub_output(c: &mut Criterion) {
    let mut group = c.benchmark_group("EpubOutput");
    group.sample_size(10);

    let plugin = EpubOutputPlugin;
    let dir = tempfile::tempdir().unwrap();
    let opts = ConversionOptions::default();
    let minify = ConversionOptions {
        minify_css: true,
        ..ConversionOptions::default()
    };

    for (name, chapters, images, opts) in [
        ("10_chapters_0_images", 10, 0, &opts),
        ("50_chapters_20_images", 50, 20, &opts),
        ("200_chapters_0_images", 200, 0, &opts),
        ("10_chapters_100_images", 10, 100, &opts),
        ("200_chapters_100_images", 200, 100, &opts),
        ("50_chapters_minified", 50, 0, &minify),
    ] {
        let book = make_book(chapters, images);
        let out = dir.path().join(format!("{}.epub", name));
        group.bench_function(name, |b| {
            b.iter(|| {
                plugin
                    .convert(black_box(&book), &out, EbookFormat::Oeb, &Context::new(opts))
                    .unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_epub_output);
criterion_main!(benches);
