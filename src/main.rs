use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inkdex::page_index::PageIndexFile;
use inkdex::progress::IndexingProgress;
use inkdex::sidecar::Sidecar;
use inkdex::{CellMetrics, DocumentHandle, Geometry};
use log::info;
use simplelog::{Config, LevelFilter, WriteLogger};

/// Host-side diagnostic harness for the pagination/indexing core. Stands
/// in for the device UI: drives index builds, pages through documents and
/// dumps the persisted state.
#[derive(Parser)]
#[command(name = "inkdex", version, about = "Document pagination index tool")]
struct Cli {
    /// Text document to operate on
    doc: PathBuf,

    /// Display area width in pixels
    #[arg(long, default_value_t = 480)]
    width: u32,

    /// Display area height in pixels
    #[arg(long, default_value_t = 800)]
    height: u32,

    /// Font base size in pixels
    #[arg(long, default_value_t = 24)]
    font_size: u32,

    /// Vertical writing mode
    #[arg(long)]
    vertical: bool,

    /// Directory for index/bookmark/tag files (defaults to the user data dir)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Build the page index to completion (default)
    Build,
    /// Print index, bookmark and tag state
    Info,
    /// Print every page offset
    Dump,
    /// Page through the document, printing rendered pages
    Read {
        #[arg(default_value_t = 3)]
        pages: usize,
    },
}

fn state_dir(cli: &Cli) -> PathBuf {
    cli.state_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("inkdex")
    })
}

fn open_handle(cli: &Cli) -> Result<DocumentHandle> {
    let geometry = Geometry {
        area_width: cli.width,
        area_height: cli.height,
        font_size: cli.font_size,
        vertical: cli.vertical,
    };
    DocumentHandle::open(&cli.doc, &state_dir(cli), geometry, Arc::new(CellMetrics))
        .with_context(|| format!("Failed to open {:?}", cli.doc))
}

fn build(cli: &Cli) -> Result<()> {
    let handle = open_handle(cli)?;
    while !handle.is_index_complete() {
        println!(
            "indexing... {:3}% ({} pages)",
            handle.indexing_progress_percent(),
            handle.known_page_count()
        );
        std::thread::sleep(Duration::from_millis(200));
    }
    println!(
        "complete: {} pages, {} bytes",
        handle.known_page_count(),
        handle.file_size()
    );
    Ok(())
}

fn print_info(cli: &Cli) -> Result<()> {
    let sidecar = Sidecar::new(&state_dir(cli), &cli.doc);
    let index = PageIndexFile::new(sidecar.page_index());

    if index.exists() {
        match index.validate() {
            Ok(pages) => println!("index: {pages} pages"),
            Err(e) => println!("index: invalid ({e})"),
        }
    } else {
        println!("index: none");
    }
    println!("complete marker: {}", sidecar.complete().exists());
    match IndexingProgress::load(&sidecar.progress()) {
        Some(p) => println!(
            "progress: scanned {} of {} bytes (updated {})",
            p.scan_offset, p.file_size, p.updated
        ),
        None => println!("progress: none"),
    }

    let bookmarks = inkdex::bookmark::BookmarkStore::new(sidecar.bookmark());
    match bookmarks.load() {
        Some(bm) => println!(
            "bookmark: page {} at byte {} ({}h{:02}m read)",
            bm.page, bm.byte_position, bm.read_hours, bm.read_minutes
        ),
        None => println!("bookmark: none"),
    }

    let tags = inkdex::tags::TagStore::new(sidecar.tags()).load();
    println!("tags: {}", tags.len());
    for tag in tags {
        let kind = if tag.is_auto { "auto" } else { "manual" };
        println!("  [{kind}] byte {} ({}%) \"{}\"", tag.position, tag.percent, tag.preview);
    }
    Ok(())
}

fn dump(cli: &Cli) -> Result<()> {
    let sidecar = Sidecar::new(&state_dir(cli), &cli.doc);
    let offsets = PageIndexFile::new(sidecar.page_index())
        .load()
        .context("No readable page index; run `build` first")?;
    for (page, offset) in offsets.iter().enumerate() {
        println!("{page:6} {offset:10}");
    }
    Ok(())
}

fn read(cli: &Cli, pages: usize) -> Result<()> {
    let mut handle = open_handle(cli)?;
    for _ in 0..pages {
        let page_no = handle.current_page_index();
        let text = handle.current_page()?.to_string();
        println!("--- page {page_no} ({}%) ---", handle.percent_through());
        println!("{text}");
        handle.update_auto_tag();
        if !handle.next_page()? {
            break;
        }
    }
    handle.close();
    Ok(())
}

fn main() -> Result<()> {
    WriteLogger::init(
        LevelFilter::Debug,
        Config::default(),
        File::create("inkdex.log")?,
    )?;
    info!("Starting inkdex");

    let cli = Cli::parse();
    match cli.command {
        None | Some(Command::Build) => build(&cli),
        Some(Command::Info) => print_info(&cli),
        Some(Command::Dump) => dump(&cli),
        Some(Command::Read { pages }) => read(&cli, pages),
    }
}
