//! Benchmarks for ebook conversion transforms.

use std::collections::BTreeSet;
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use convert_core::book::{BookDocument, ManifestData, TocEntry};
use convert_core::options::ConversionOptions;
use convert_core::plugin::{Context, Transform};
use convert_transforms::data_url::DataUrl;
use convert_transforms::flatten_css::FlattenCss;
use convert_transforms::generate_toc::GenerateToc;
use convert_transforms::manifest_trimmer::ManifestTrimmer;
use convert_transforms::merge_metadata::MergeMetadata;
use convert_transforms::normalize_links::NormalizeLinks;
use convert_transforms::rasterize::RasterizeImages;
use convert_transforms::remove_unused_css::RemoveUnusedCss;
use convert_transforms::split::SplitOnPageBreaks;
use convert_transforms::subset_fonts::{FontSubsetter, SubsetError, SubsetFonts};

const CSS: &str = "body { margin: 1em; font-family: serif; line-height: 1.6; }\n\
                   p { margin: 0.5em 0; text-indent: 1em; }\n\
                   h1, h2, h3 { font-family: sans-serif; }\n\
                   .chapter { page-break-before: always; }\n\
                   .never-used { color: red; }\n\
                   img { max-width: 100%; height: auto; }";

/// Create a realistic BookDocument with N chapters and images.
fn make_book(num_chapters: usize, num_images: usize) -> BookDocument {
    let mut book = BookDocument::new();
    book.metadata.set_title("Benchmark Book");
    book.metadata.add("creator", "Bench Author");
    book.metadata.set("language", "en");

    book.add_item("style.css", "text/css", ManifestData::binary(CSS.as_bytes().to_vec()))
        .unwrap();

    for i in 0..num_chapters {
        let href = format!("chapter{}.xhtml", i);
        let body = format!(
            "<h1>Chapter {}</h1>\n\
             <p>This is paragraph one of chapter {}. It contains some text to simulate a real ebook.</p>\n\
             <h2>Section</h2>\n\
             <p style=\"text-indent: 0\">This is paragraph two with <strong>bold</strong> and <em>italic</em> text.</p>\n\
             <div class=\"chapter\"><p>Lorem ipsum dolor sit amet, consectetur adipiscing elit.</p></div>\n\
             <p><a href=\"chapter{}.xhtml\">next</a></p>",
            i,
            i,
            (i + 1) % num_chapters.max(1)
        );
        let xhtml = convert_utils::xml::xhtml11_document(
            &format!("Chapter {}", i),
            "en",
            Some("style.css"),
            &body,
        );
        book.add_item(&href, "application/xhtml+xml", ManifestData::binary(xhtml.into_bytes()))
            .unwrap();
        book.add_to_spine(&href, true).unwrap();
    }

    for i in 0..num_images {
        let mut img = image::RgbaImage::new(10, 10);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgba([
                (i * 37 % 256) as u8,
                (i * 73 % 256) as u8,
                (i * 119 % 256) as u8,
                255,
            ]);
        }
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        book.add_item(&format!("images/img{}.png", i), "image/png", ManifestData::binary(buf))
            .unwrap();
    }

    book.parse_all().unwrap();
    book
}

/// Create a book with data: URIs embedded in XHTML.
fn make_book_with_data_urls(num_chapters: usize) -> BookDocument {
    let mut book = BookDocument::new();
    book.metadata.set_title("Data URL Book");

    let pixel_png = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNk+M9QDwADhgGAWjR9awAAAABJRU5ErkJggg==";

    for i in 0..num_chapters {
        let href = format!("chapter{}.xhtml", i);
        let body = format!(
            "<h1>Chapter {}</h1>\n\
             <p>Text with embedded image:</p>\n\
             <img src=\"data:image/png;base64,{}\" />\n\
             <p>More text after the image.</p>\n\
             <img src=\"data:image/png;base64,{}\" />",
            i, pixel_png, pixel_png
        );
        let xhtml =
            convert_utils::xml::xhtml11_document(&format!("Chapter {}", i), "en", None, &body);
        book.add_item(&href, "application/xhtml+xml", ManifestData::binary(xhtml.into_bytes()))
            .unwrap();
        book.add_to_spine(&href, true).unwrap();
    }

    book.parse_all().unwrap();
    book
}

fn make_book_with_fonts(num_chapters: usize) -> BookDocument {
    let mut book = make_book(num_chapters, 0);
    let css = format!(
        "{}\n@font-face {{ font-family: Body; src: url(fonts/body.ttf) }}\n\
         @font-face {{ font-family: Unused; src: url(fonts/unused.ttf) }}\n\
         p {{ font-family: Body }}",
        CSS
    );
    book.set_bytes("style.css", css.into_bytes()).unwrap();
    book.parse("style.css").unwrap();
    for name in ["fonts/body.ttf", "fonts/unused.ttf"] {
        book.add_item(name, "font/ttf", ManifestData::binary(vec![0; 4096]))
            .unwrap();
    }
    book
}

struct NullSubsetter;

impl FontSubsetter for NullSubsetter {
    fn subset(
        &self,
        data: &[u8],
        _media_type: &str,
        _chars: &BTreeSet<char>,
    ) -> Result<Vec<u8>, SubsetError> {
        Ok(data.to_vec())
    }
}

fn run(transform: &dyn Transform, book: &mut BookDocument, opts: &ConversionOptions) {
    transform.apply(black_box(book), &Context::new(opts)).unwrap();
}

/// Transforms whose cost scales with the number of content documents.
fn bench_chapter_transforms(c: &mut Criterion) {
    let opts = ConversionOptions::default();
    let cases: [(&str, &dyn Transform, &[usize]); 6] = [
        ("MergeMetadata", &MergeMetadata, &[10]),
        ("NormalizeLinks", &NormalizeLinks, &[10, 50]),
        ("GenerateTOC", &GenerateToc, &[10, 50, 100]),
        ("FlattenCSS", &FlattenCss, &[10, 50, 100]),
        ("SplitOnPageBreaks", &SplitOnPageBreaks, &[10, 50]),
        ("RemoveUnusedCSS", &RemoveUnusedCss, &[10, 50]),
    ];

    for (name, transform, sizes) in cases {
        let mut group = c.benchmark_group(name);
        for &n in sizes {
            group.bench_function(format!("{}_chapters", n), |b| {
                b.iter_batched(
                    || make_book(n, 0),
                    |mut book| run(transform, &mut book, &opts),
                    BatchSize::LargeInput,
                )
            });
        }
        group.finish();
    }
}

fn bench_subset_fonts(c: &mut Criterion) {
    let transform = SubsetFonts::with_subsetter(Arc::new(NullSubsetter));
    let opts = ConversionOptions::default();
    c.bench_function("SubsetFonts/20_chapters", |b| {
        b.iter_batched(
            || make_book_with_fonts(20),
            |mut book| run(&transform, &mut book, &opts),
            BatchSize::LargeInput,
        )
    });
}

fn with_blank_images(num_images: usize, size: u32) -> BookDocument {
    let mut book = make_book(1, 0);
    for i in 0..num_images {
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgba8(image::RgbaImage::new(size, size))
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        book.add_item(&format!("images/img{}.png", i), "image/png", ManifestData::binary(buf))
            .unwrap();
    }
    book
}

fn bench_rasterize(c: &mut Criterion) {
    let mut group = c.benchmark_group("RasterizeImages");
    group.sample_size(10);

    for (images, size, limit) in [(20, 200, (100, 100)), (50, 1000, (600, 800))] {
        let opts = ConversionOptions {
            max_image_size: Some(limit),
            ..ConversionOptions::default()
        };
        group.bench_function(format!("{}_images_{}x{}", images, size, size), |b| {
            b.iter_batched(
                || with_blank_images(images, size),
                |mut book| run(&RasterizeImages::new(), &mut book, &opts),
                BatchSize::LargeInput,
            )
        });
    }

    group.finish();
}

fn bench_manifest_trimmer(c: &mut Criterion) {
    let opts = ConversionOptions::default();
    c.bench_function("ManifestTrimmer/100_chapters_50_unreferenced", |b| {
        b.iter_batched(
            || {
                let mut book = make_book(100, 50);
                book.toc.add(TocEntry::new("Start", "chapter0.xhtml"));
                book
            },
            |mut book| run(&ManifestTrimmer, &mut book, &opts),
            BatchSize::LargeInput,
        )
    });
}

fn bench_data_url(c: &mut Criterion) {
    let mut group = c.benchmark_group("DataURL");
    let opts = ConversionOptions::default();
    for n in [10, 50] {
        group.bench_function(format!("{}_chapters", n), |b| {
            b.iter_batched(
                || make_book_with_data_urls(n),
                |mut book| run(&DataUrl, &mut book, &opts),
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_chapter_transforms,
    bench_subset_fonts,
    bench_rasterize,
    bench_manifest_trimmer,
    bench_data_url,
);
criterion_main!(benches);
