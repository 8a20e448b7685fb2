//! ebook-convert-rs: converts ebooks between formats through the OEB
//! pipeline.
//!
//! Supports two CLI modes:
//! - Legacy: `ebook-convert-rs input.epub output.epub [--options]`
//! - Modern: `ebook-convert-rs convert --from html --to epub input.html -o output.epub`

mod config;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use convert_core::book::EbookFormat;
use convert_core::options::{OptionSet, OptionValue, OutputProfile};
use convert_core::pipeline::PipelineBuilder;
use convert_core::registry::PluginRegistry;

#[derive(Parser)]
#[command(
    name = "ebook-convert-rs",
    version,
    about = "Fast ebook format converter"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input file or OEB directory (legacy mode)
    input: Option<PathBuf>,

    /// Output file; a path without extension is written as an OEB directory (legacy mode)
    output: Option<PathBuf>,

    /// Verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Extra configuration file, merged over the global and local ones
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Dump effective merged config as TOML and exit
    #[arg(long, global = true)]
    dump_config: bool,

    /// List the supported input and output formats and exit
    #[arg(long, global = true)]
    list_formats: bool,

    #[command(flatten)]
    options: OptionFlags,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an ebook (modern interface)
    Convert {
        /// Input file
        input: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Input format (detected from the file if omitted)
        #[arg(long)]
        from: Option<String>,

        /// Output format (taken from the output extension if omitted)
        #[arg(long)]
        to: Option<String>,
    },
}

/// Flags that map onto named conversion options.
#[derive(Args, Default)]
struct OptionFlags {
    /// Output device profile
    #[arg(long, global = true)]
    output_profile: Option<String>,

    /// Character encoding of text and HTML input
    #[arg(long, global = true)]
    input_encoding: Option<String>,

    /// Extra CSS to apply
    #[arg(long, global = true)]
    extra_css: Option<String>,

    /// Comma separated CSS properties to remove
    #[arg(long, global = true)]
    filter_css: Option<String>,

    /// Base font size in points
    #[arg(long, global = true)]
    base_font_size: Option<f64>,

    /// Page margins in points
    #[arg(long, global = true)]
    margin_top: Option<f64>,
    #[arg(long, global = true)]
    margin_bottom: Option<f64>,
    #[arg(long, global = true)]
    margin_left: Option<f64>,
    #[arg(long, global = true)]
    margin_right: Option<f64>,

    /// Regular expression matching chapter titles
    #[arg(long = "chapter", global = true, value_name = "REGEX")]
    chapter_regex: Option<String>,

    /// CSS selectors of elements that start a new file
    #[arg(long, global = true, value_name = "SELECTORS")]
    page_breaks_before: Option<String>,

    /// Deepest heading level included in the generated TOC
    #[arg(long, global = true)]
    toc_depth: Option<u8>,

    /// Maximum number of TOC entries (0 for no limit)
    #[arg(long, global = true)]
    max_toc_links: Option<usize>,

    /// Maximum image size (WxH). Defaults to output profile screen size.
    #[arg(long, global = true)]
    max_image_size: Option<String>,

    /// Minify CSS in the output
    #[arg(long, global = true)]
    minify_css: bool,

    /// Do not embed fonts referenced by @font-face rules
    #[arg(long, global = true)]
    no_embed_fonts: bool,

    /// Paragraph style of plain text input: auto, block, single, print, unformatted
    #[arg(long, global = true)]
    paragraph_type: Option<String>,

    /// Debug pipeline output directory
    #[arg(long, global = true)]
    debug_pipeline: Option<PathBuf>,

    /// Title of the output book
    #[arg(long, global = true)]
    title: Option<String>,

    /// Authors, separated by '&'
    #[arg(long, global = true)]
    authors: Option<String>,

    /// Language code of the book
    #[arg(long, global = true)]
    language: Option<String>,

    /// Publisher of the book
    #[arg(long, global = true)]
    publisher: Option<String>,

    /// Comma separated tags
    #[arg(long, global = true)]
    tags: Option<String>,

    /// Set any option by name (repeatable)
    #[arg(short = 'O', long = "option", global = true, value_name = "NAME=VALUE")]
    extra: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&cli) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let registry = Arc::new(build_registry());

    if cli.list_formats {
        let names = |formats: Vec<EbookFormat>| {
            formats
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!("Input formats:  {}", names(registry.input_formats()));
        println!("Output formats: {}", names(registry.output_formats()));
        return Ok(());
    }

    let mut options = config::load(&config::default_layers(cli.config.as_deref()))?;
    apply_cli_overrides(&mut options, cli)?;

    if cli.dump_config {
        let text =
            toml::to_string_pretty(options.options()).context("Error serializing config")?;
        println!("{}", text);
        return Ok(());
    }

    match &cli.command {
        Some(Commands::Convert {
            input,
            output,
            from,
            to,
        }) => run_conversion(registry, input, output, from.as_deref(), to.as_deref(), options),
        None => match (&cli.input, &cli.output) {
            (Some(input), Some(output)) => {
                run_conversion(registry, input, output, None, None, options)
            }
            _ => {
                eprintln!("Usage: ebook-convert-rs <input> <output> [options]");
                eprintln!("   or: ebook-convert-rs convert <input> -o <output> [options]");
                process::exit(1);
            }
        },
    }
}

/// The plugins this binary ships with.
fn build_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry
        .register_input(convert_input_oeb::OebInputPlugin)
        .register_input(convert_input_epub::EpubInputPlugin)
        .register_input(convert_input_html::HtmlInputPlugin)
        .register_input(convert_input_txt::TxtInputPlugin)
        .register_output(convert_output_oeb::OebOutputPlugin)
        .register_output(convert_output_epub::EpubOutputPlugin);
    registry
}

/// Apply CLI flags on top of config-loaded options. Only flags that were
/// given override; each override is recorded as a user value. `-O` pairs
/// are applied last.
fn apply_cli_overrides(options: &mut OptionSet, cli: &Cli) -> Result<()> {
    let flags = &cli.options;

    if cli.verbose > 0 {
        options.set_user("verbose", OptionValue::Int(i64::from(cli.verbose)))?;
    }

    if let Some(name) = &flags.output_profile {
        let profile = OutputProfile::preset(name).with_context(|| {
            format!(
                "unknown output profile '{}' (known: {})",
                name,
                OutputProfile::preset_names().join(", ")
            )
        })?;
        options.options_mut().output_profile = profile;
        options.mark_user("output_profile")?;
    }

    let strings = [
        ("input_encoding", &flags.input_encoding),
        ("extra_css", &flags.extra_css),
        ("filter_css", &flags.filter_css),
        ("chapter_regex", &flags.chapter_regex),
        ("page_breaks_before", &flags.page_breaks_before),
        ("max_image_size", &flags.max_image_size),
        ("paragraph_type", &flags.paragraph_type),
        ("title", &flags.title),
        ("language", &flags.language),
        ("publisher", &flags.publisher),
    ];
    for (name, value) in strings {
        if let Some(value) = value {
            options.set_user(name, OptionValue::Str(value.clone()))?;
        }
    }

    let floats = [
        ("base_font_size", flags.base_font_size),
        ("margin_top", flags.margin_top),
        ("margin_bottom", flags.margin_bottom),
        ("margin_left", flags.margin_left),
        ("margin_right", flags.margin_right),
    ];
    for (name, value) in floats {
        if let Some(value) = value {
            options.set_user(name, OptionValue::Float(value))?;
        }
    }

    if let Some(depth) = flags.toc_depth {
        options.set_user("toc_depth", OptionValue::Int(i64::from(depth)))?;
    }
    if let Some(links) = flags.max_toc_links {
        options.set_user("max_toc_links", OptionValue::Int(links as i64))?;
    }
    if flags.minify_css {
        options.set_user("minify_css", OptionValue::Bool(true))?;
    }
    if flags.no_embed_fonts {
        options.set_user("embed_fonts", OptionValue::Bool(false))?;
    }
    if let Some(dir) = &flags.debug_pipeline {
        options.set_user(
            "debug_pipeline",
            OptionValue::Str(dir.to_string_lossy().into_owned()),
        )?;
    }
    if let Some(authors) = &flags.authors {
        options.set_user("authors", OptionValue::List(split_list(authors, '&')))?;
    }
    if let Some(tags) = &flags.tags {
        options.set_user("tags", OptionValue::List(split_list(tags, ',')))?;
    }

    for pair in &flags.extra {
        let (name, value) = config::parse_option_pair(pair)?;
        options
            .options_mut()
            .set_from_str(&name, &value)
            .with_context(|| format!("invalid -O {}", pair))?;
        options.mark_user(&name)?;
    }
    Ok(())
}

fn split_list(s: &str, sep: char) -> Vec<String> {
    s.split(sep)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn run_conversion(
    registry: Arc<PluginRegistry>,
    input: &Path,
    output: &Path,
    from: Option<&str>,
    to: Option<&str>,
    mut options: OptionSet,
) -> Result<()> {
    if let Some(name) = from {
        let format = EbookFormat::from_name(name)
            .with_context(|| format!("Unknown input format '{}'", name))?;
        options.options_mut().input_format = Some(format);
    }
    if let Some(name) = to {
        let format = EbookFormat::from_name(name)
            .with_context(|| format!("Unknown output format '{}'", name))?;
        options.options_mut().output_format = Some(format);
    }

    log::info!("Converting {} → {}", input.display(), output.display());

    let pipeline = PipelineBuilder::new()
        .registry(registry)
        .transforms(convert_transforms::standard_transforms())
        .progress_reporter(Box::new(|frac, msg| {
            if frac < 1.0 {
                log::info!("[{:3.0}%] {}", frac * 100.0, msg);
            } else {
                log::info!("Done!");
            }
        }))
        .build()?;

    pipeline
        .run(input, output, &options)
        .with_context(|| format!("converting {}", input.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use convert_core::options::{ConversionOptions, OptionRecommendation, Priority};

    fn overrides(args: &[&str]) -> OptionSet {
        let cli = Cli::try_parse_from(args).unwrap();
        let mut options = OptionSet::new(ConversionOptions::default());
        apply_cli_overrides(&mut options, &cli).unwrap();
        options
    }

    #[test]
    fn test_flags_are_user_values() {
        let options = overrides(&[
            "ebook-convert-rs",
            "in.html",
            "out.epub",
            "--toc-depth",
            "2",
            "--margin-left",
            "12.5",
            "--authors",
            "Ann & Bob",
            "--output-profile",
            "kobo",
            "--minify-css",
        ]);
        let opts = options.options();
        assert_eq!(opts.toc_depth, 2);
        assert_eq!(opts.margin_left, 12.5);
        assert_eq!(opts.authors, vec!["Ann", "Bob"]);
        assert_eq!(opts.output_profile.name, "kobo");
        assert!(opts.minify_css);
        assert_eq!(options.priority_of("toc_depth"), Some(Priority::User));
        assert_eq!(options.priority_of("output_profile"), Some(Priority::User));
        assert_eq!(options.priority_of("margin_top"), None);
    }

    #[test]
    fn test_user_values_beat_recommendations() {
        let mut options = overrides(&["ebook-convert-rs", "--toc-depth", "1", "a.txt", "b.epub"]);
        let rec = OptionRecommendation::new("toc_depth", 5i64, Priority::High);
        assert!(!options.recommend(&rec).unwrap());
        assert_eq!(options.options().toc_depth, 1);
    }

    #[test]
    fn test_option_pairs_apply_last() {
        let options = overrides(&[
            "ebook-convert-rs",
            "convert",
            "in.txt",
            "-o",
            "out.epub",
            "--max-toc-links",
            "3",
            "-O",
            "max-toc-links=7",
            "-O",
            "remove_unused_css=no",
        ]);
        assert_eq!(options.options().max_toc_links, 7);
        assert!(!options.options().remove_unused_css);
        assert_eq!(options.priority_of("remove_unused_css"), Some(Priority::User));
    }

    #[test]
    fn test_bad_values_are_reported() {
        let cli = Cli::try_parse_from(["ebook-convert-rs", "-O", "toc_depth=deep"]).unwrap();
        let mut options = OptionSet::new(ConversionOptions::default());
        assert!(apply_cli_overrides(&mut options, &cli).is_err());

        let cli =
            Cli::try_parse_from(["ebook-convert-rs", "--output-profile", "nonesuch"]).unwrap();
        let mut options = OptionSet::new(ConversionOptions::default());
        let err = apply_cli_overrides(&mut options, &cli).unwrap_err();
        assert!(format!("{:#}", err).contains("kobo"));
    }

    #[test]
    fn test_registry_formats() {
        let registry = build_registry();
        let inputs = registry.input_formats();
        for format in [
            EbookFormat::Oeb,
            EbookFormat::Epub,
            EbookFormat::Html,
            EbookFormat::Xhtml,
            EbookFormat::Txt,
            EbookFormat::Markdown,
        ] {
            assert!(inputs.contains(&format), "missing input {}", format);
        }
        assert_eq!(
            registry.output_formats(),
            vec![EbookFormat::Oeb, EbookFormat::Epub]
        );
    }

    #[test]
    fn test_oeb_identity_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("text")).unwrap();
        std::fs::write(
            source.join("text/ch1.xhtml"),
            convert_utils::xml::xhtml11_document("One", "en", Some("../style.css"), "<p>One</p>"),
        )
        .unwrap();
        std::fs::write(source.join("style.css"), "p { margin: 0 }").unwrap();
        std::fs::write(
            source.join("content.opf"),
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="uid" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Identity</dc:title>
    <dc:language>en</dc:language>
    <dc:identifier id="uid">urn:uuid:1b4e28ba-2fa1-11d2-883f-0016d3cca427</dc:identifier>
  </metadata>
  <manifest>
    <item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="style.css" media-type="text/css"/>
  </manifest>
  <spine><itemref idref="ch1"/></spine>
</package>"#,
        )
        .unwrap();

        let pipeline = PipelineBuilder::new()
            .registry(Arc::new(build_registry()))
            .build()
            .unwrap();
        let out = dir.path().join("copy");
        pipeline
            .run(&source, &out, &OptionSet::new(ConversionOptions::default()))
            .unwrap();

        let before = convert_core::opf::read_opf(&source.join("content.opf")).unwrap();
        let after = convert_core::opf::read_opf(&out.join("content.opf")).unwrap();
        let items = |book: &convert_core::book::BookDocument| {
            book.manifest
                .iter()
                .map(|i| (i.href.clone(), i.media_type.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(items(&after), items(&before));
        assert_eq!(after.spine_hrefs(), before.spine_hrefs());
        assert_eq!(after.uid, before.uid);
        assert_eq!(after.metadata.title(), Some("Identity"));
    }

    #[test]
    fn test_txt_to_epub_and_oeb() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("story.txt");
        std::fs::write(&input, "Once upon a time.\n\nThe end.\n").unwrap();
        let registry = Arc::new(build_registry());

        let epub = dir.path().join("story.epub");
        run_conversion(
            registry.clone(),
            &input,
            &epub,
            None,
            None,
            OptionSet::new(ConversionOptions::default()),
        )
        .unwrap();
        let names = convert_utils::archive::list_zip_entries(&epub).unwrap();
        assert_eq!(names[0], "mimetype");

        let oeb = dir.path().join("story_oeb");
        run_conversion(
            registry,
            &epub,
            &oeb,
            None,
            None,
            OptionSet::new(ConversionOptions::default()),
        )
        .unwrap();
        let book = convert_core::opf::read_opf(&oeb.join("content.opf")).unwrap();
        assert_eq!(book.metadata.title(), Some("story"));
        assert_eq!(book.spine.len(), 1);
    }
}
