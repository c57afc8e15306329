use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use directories::ProjectDirs;
use inkshade_core::{
    ChunkedSearch, Command, DocumentBackend, DocumentMetadata, DocumentProvider, ExportMessage,
    FileStateStore, NullSurface, PageModel, PageTextLayer, PersistedViewState, PointerOutcome,
    Rect, ScrollEvent, SearchMessage, SearchResult, SearchWorker, StateStore, TextExportWorker,
    Viewer, ViewerConfig, ViewerError, ViewerEvent,
};
use inkshade_render::PdfiumRenderFactory;
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "inkshade",
    version,
    about = "Headless driver for the inkshade document viewer core"
)]
struct Args {
    /// Config file to load instead of the platform default
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Pages kept materialized on each side of the current page
    #[arg(long, global = true)]
    buffer_pages: Option<usize>,

    /// Pdfium shared library to bind
    #[arg(long, global = true)]
    pdfium: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Print the extracted text of one page or the whole document
    Text {
        file: PathBuf,
        /// Page to print (0-based); all pages when omitted
        #[arg(short, long)]
        page: Option<usize>,
        /// Print block and line structure with bounding boxes
        #[arg(long)]
        blocks: bool,
    },
    /// Select text on a page by dragging between two points or inside a box
    Select(SelectArgs),
    /// Find every occurrence of a string
    Search {
        file: PathBuf,
        query: String,
        /// Run on a worker thread instead of cooperative chunks
        #[arg(long)]
        background: bool,
        /// Emit results as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Write the text of every page to a file
    Export { file: PathBuf, output: PathBuf },
    /// Render one page to a PNG
    Render {
        file: PathBuf,
        #[arg(short, long, default_value_t = 0)]
        page: usize,
        /// Zoom in percent of the base zoom
        #[arg(short, long, default_value_t = 100)]
        zoom: u32,
        #[arg(long)]
        dark: bool,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Open a document in a virtual viewport, scroll it and persist the view
    View(ViewArgs),
}

#[derive(Debug, ClapArgs)]
struct SelectArgs {
    file: PathBuf,
    #[arg(short, long, default_value_t = 0)]
    page: usize,
    /// Drag start in page points, as `x,y`
    #[arg(long, value_parser = parse_point, requires = "to", conflicts_with = "rect")]
    from: Option<(f32, f32)>,
    /// Drag end in page points, as `x,y`; may lie on a later page with `--to-page`
    #[arg(long, value_parser = parse_point)]
    to: Option<(f32, f32)>,
    #[arg(long)]
    to_page: Option<usize>,
    /// Box in page points, as `x0,y0,x1,y1`
    #[arg(long, value_parser = parse_rect)]
    rect: Option<Rect>,
    /// Click count at `--from`: 2 selects a word, 3 a line
    #[arg(long, default_value_t = 1)]
    clicks: u8,
}

#[derive(Debug, ClapArgs)]
struct ViewArgs {
    file: PathBuf,
    /// Page to open on (0-based); overrides the saved position
    #[arg(short, long)]
    page: Option<usize>,
    /// Zoom in percent of the base zoom
    #[arg(short, long)]
    zoom: Option<u32>,
    #[arg(long)]
    toggle_dark: bool,
    /// Viewport height in screen pixels
    #[arg(long, default_value_t = 900.0)]
    height: f32,
    /// Scroll by this many pixels; repeatable
    #[arg(long = "scroll-by", allow_hyphen_values = true)]
    scroll_by: Vec<f32>,
    /// Do not read or write the saved view state
    #[arg(long)]
    no_state: bool,
}

#[derive(Debug, Serialize)]
struct ViewSummary {
    path: PathBuf,
    #[serde(flatten)]
    metadata: DocumentMetadata,
    page_count: usize,
    current_page: usize,
    offset_in_page: f32,
    zoom_percent: u32,
    dark_mode: bool,
    materialized: Vec<usize>,
    failed_pages: Vec<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "inkshade", "inkshade")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&args, &project_dirs)?;

    let provider = PdfiumRenderFactory::new(config.pdfium_library_path.as_deref())?;
    match args.command {
        Cmd::Text { file, page, blocks } => {
            let backend = open(&provider, &file).await?;
            print_text(backend.as_ref(), page, blocks)
        }
        Cmd::Select(select) => {
            let backend = open(&provider, &select.file).await?;
            run_select(backend, config, &select)
        }
        Cmd::Search {
            file,
            query,
            background,
            json,
        } => {
            let backend = open(&provider, &file).await?;
            let results = if background {
                search_in_background(backend, &query).await?
            } else {
                search_in_chunks(backend, &query, config.search_chunk_size)
            };
            print_results(&results, json)
        }
        Cmd::Export { file, output } => {
            let backend = open(&provider, &file).await?;
            run_export(backend, output).await
        }
        Cmd::Render {
            file,
            page,
            zoom,
            dark,
            output,
        } => {
            let backend = open(&provider, &file).await?;
            render_png(backend, &config, page, zoom, dark, &output)
        }
        Cmd::View(view) => {
            let backend = open(&provider, &view.file).await?;
            let store = FileStateStore::new(project_dirs.data_local_dir().join("state"))?;
            run_view(backend, config, &store, &view)
        }
    }
}

async fn open(provider: &PdfiumRenderFactory, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
    provider
        .open(path)
        .await
        .with_context(|| format!("failed to open {:?}", path))
}

fn load_config(args: &Args, project_dirs: &ProjectDirs) -> Result<ViewerConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ViewerConfig::load(&path)?;
    if let Some(buffer_pages) = args.buffer_pages {
        config.buffer_pages = buffer_pages;
    }
    if let Some(library) = &args.pdfium {
        config.pdfium_library_path = Some(library.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_text(backend: &dyn DocumentBackend, page: Option<usize>, blocks: bool) -> Result<()> {
    let pages = match page {
        Some(page) if page >= backend.page_count() => {
            bail!(
                "page {page} out of range (document has {} pages)",
                backend.page_count()
            )
        }
        Some(page) => page..page + 1,
        None => 0..backend.page_count(),
    };

    let mut stdout = io::stdout().lock();
    for page_index in pages {
        let layer = PageTextLayer::from_backend(backend, page_index);
        writeln!(stdout, "== page {page_index} ==")?;
        if blocks {
            for block in layer.blocks() {
                writeln!(stdout, "[block {}] {}", block.block_index, format_rect(block.bbox))?;
                for line in &block.lines {
                    writeln!(stdout, "  [line {}] {}  {}", line.line_index, format_rect(line.bbox), line.text)?;
                }
            }
        } else {
            writeln!(stdout, "{}", layer.full_text())?;
        }
    }
    Ok(())
}

fn run_select(backend: Arc<dyn DocumentBackend>, config: ViewerConfig, args: &SelectArgs) -> Result<()> {
    if let Some(rect) = args.rect {
        let mut page = PageModel::new(backend, args.page, config.bitmap_cache_capacity);
        page.size()
            .with_context(|| format!("failed to open page {}", args.page))?;
        // Page points at zoom 1 need no scaling.
        println!("{}", page.text_in_rect(rect, 1.0));
        page.unload();
        return Ok(());
    }

    let (from, to) = match (args.from, args.to) {
        (Some(from), Some(to)) => (from, to),
        _ => bail!("either --rect or --from/--to is required"),
    };
    let to_page = args.to_page.unwrap_or(args.page);

    let mut viewer = Viewer::new(backend, NullSurface, config)?;
    viewer.resize(viewer.config().container_width, 900.0);
    viewer.apply(Command::GotoPage(args.page))?;
    let zoom = viewer.viewport().zoom();

    match viewer.press(args.page, from.0 * zoom, from.1 * zoom, args.clicks)? {
        PointerOutcome::Selecting => {
            viewer.drag(to_page, to.0 * zoom, to.1 * zoom);
            viewer.release();
        }
        PointerOutcome::Selected => {}
        PointerOutcome::Link(link) => {
            println!("link: {}", link.display_text());
            return Ok(());
        }
        PointerOutcome::Ignored => {
            warn!(page = args.page, "no text near the start point");
            return Ok(());
        }
    }

    for page_index in viewer.selection().selected_pages() {
        if let Some(slice) = viewer.selection_for(page_index) {
            info!(page = page_index, chars = slice.characters.len(), rects = slice.rects.len(), "selected");
        }
    }
    println!("{}", viewer.selected_text());
    Ok(())
}

fn search_in_chunks(backend: Arc<dyn DocumentBackend>, query: &str, chunk_size: usize) -> Vec<SearchResult> {
    let mut search = ChunkedSearch::new(backend, query, chunk_size);
    while !search.is_finished() {
        let progress = search.step();
        info!(
            pages = progress.pages_done,
            page_count = progress.page_count,
            hits = progress.results,
            "search progress"
        );
    }
    search.into_results().results().to_vec()
}

async fn search_in_background(backend: Arc<dyn DocumentBackend>, query: &str) -> Result<Vec<SearchResult>> {
    let mut worker = SearchWorker::spawn(backend, query).context("failed to start search worker")?;
    let mut results = Vec::new();
    while let Some(message) = worker.next().await {
        match message {
            SearchMessage::Progress { page, page_count } => {
                info!(page, page_count, "searching");
            }
            SearchMessage::Found(result) => results.push(result),
            SearchMessage::Finished { total } => {
                info!(total, "search finished");
                break;
            }
        }
    }
    Ok(results)
}

fn print_results(results: &[SearchResult], json: bool) -> Result<()> {
    let mut stdout = io::stdout().lock();
    for result in results {
        if json {
            writeln!(stdout, "{}", serde_json::to_string(result)?)?;
        } else {
            writeln!(
                stdout,
                "page {}: {} {:?}",
                result.page_index,
                format_rect(result.rect),
                result.text
            )?;
        }
    }
    if !json {
        writeln!(stdout, "{} matches", results.len())?;
    }
    Ok(())
}

async fn run_export(backend: Arc<dyn DocumentBackend>, output: PathBuf) -> Result<()> {
    let mut worker = TextExportWorker::spawn(backend, output).context("failed to start export worker")?;
    while let Some(message) = worker.next().await {
        match message {
            ExportMessage::Progress { page, page_count } => {
                eprint!("\rexporting page {page}/{page_count}");
            }
            ExportMessage::Finished { path, pages } => {
                eprintln!();
                println!("wrote {pages} pages to {}", path.display());
                return Ok(());
            }
            ExportMessage::Cancelled => {
                eprintln!();
                bail!("export cancelled");
            }
            ExportMessage::Failed(message) => {
                eprintln!();
                bail!("export failed: {message}");
            }
        }
    }
    Err(anyhow!("export worker exited without a result"))
}

fn render_png(
    backend: Arc<dyn DocumentBackend>,
    config: &ViewerConfig,
    page_index: usize,
    zoom_percent: u32,
    dark: bool,
    output: &Path,
) -> Result<()> {
    if page_index >= backend.page_count() {
        bail!(
            "page {page_index} out of range (document has {} pages)",
            backend.page_count()
        );
    }
    let zoom = config.zoom_for_percent(config.clamp_zoom_percent(zoom_percent as i64));
    let mut page = PageModel::new(backend, page_index, config.bitmap_cache_capacity);
    let bitmap = page.render(zoom, dark)?;
    let image = image::RgbaImage::from_raw(bitmap.width, bitmap.height, bitmap.pixels.clone())
        .ok_or_else(|| anyhow!("rendered bitmap has an unexpected size"))?;
    image
        .save(output)
        .with_context(|| format!("failed to write {:?}", output))?;
    println!("{}x{} -> {}", bitmap.width, bitmap.height, output.display());
    Ok(())
}

fn run_view(
    backend: Arc<dyn DocumentBackend>,
    config: ViewerConfig,
    store: &dyn StateStore,
    args: &ViewArgs,
) -> Result<()> {
    let info = backend.info().clone();
    let settle_delay = config.settle_delay;
    let mut viewer = Viewer::new(backend, NullSurface, config)?;
    viewer.resize(viewer.config().container_width, args.height);

    if args.no_state {
        viewer.restore(&PersistedViewState::default())?;
    } else {
        match viewer.load_state(store) {
            Ok(found) => info!(found, "view state loaded"),
            Err(ViewerError::State(message)) => {
                warn!(%message, "ignoring unreadable view state");
                viewer.restore(&PersistedViewState::default())?;
            }
            Err(err) => return Err(err.into()),
        }
    }

    if let Some(page) = args.page {
        viewer.apply(Command::GotoPage(page))?;
    }
    if let Some(zoom) = args.zoom {
        viewer.apply(Command::SetZoom(zoom))?;
    }
    if args.toggle_dark {
        viewer.apply(Command::ToggleDarkMode)?;
    }

    let mut now = Instant::now();
    for delta in &args.scroll_by {
        let offset = viewer.viewport().scroll_offset() + delta;
        viewer.scroll(
            ScrollEvent {
                offset,
                viewport_height: args.height,
            },
            now,
        );
        now += settle_delay;
        viewer.tick(now);
    }

    let failed_pages = viewer
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            ViewerEvent::PageFailed(err) => {
                warn!(page = err.page_index, message = %err.message, "page failed to render");
                Some(err.page_index)
            }
            _ => None,
        })
        .collect();

    let snapshot = viewer.snapshot();
    if !args.no_state {
        viewer.save_state(store)?;
    }

    let summary = ViewSummary {
        path: info.path,
        metadata: info.metadata,
        page_count: viewer.page_count(),
        current_page: viewer.current_page(),
        offset_in_page: snapshot.offset_in_page,
        zoom_percent: snapshot.zoom_percent,
        dark_mode: snapshot.dark_mode,
        materialized: viewer.viewport().materialized(),
        failed_pages,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn format_rect(rect: Rect) -> String {
    format!("({:.1}, {:.1}, {:.1}, {:.1})", rect.x0, rect.y0, rect.x1, rect.y1)
}

fn parse_point(raw: &str) -> Result<(f32, f32), String> {
    match parse_floats(raw)?.as_slice() {
        [x, y] => Ok((*x, *y)),
        _ => Err(format!("expected `x,y`, got {raw:?}")),
    }
}

fn parse_rect(raw: &str) -> Result<Rect, String> {
    match parse_floats(raw)?.as_slice() {
        [x0, y0, x1, y1] => Ok(Rect::new(*x0, *y0, *x1, *y1)),
        _ => Err(format!("expected `x0,y0,x1,y1`, got {raw:?}")),
    }
}

fn parse_floats(raw: &str) -> Result<Vec<f32>, String> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .map_err(|err| format!("{part:?}: {err}"))
        })
        .collect()
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "inkshade.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    // stdout carries command output.
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_points_and_rects() {
        assert_eq!(parse_point("12.5, 40").unwrap(), (12.5, 40.0));
        assert!(parse_point("1,2,3").is_err());
        assert!(parse_point("a,2").is_err());
        assert_eq!(parse_rect("0,0,10,20").unwrap(), Rect::new(0.0, 0.0, 10.0, 20.0));
    }

    #[test]
    fn cli_flags_parse() {
        let args = Args::try_parse_from([
            "inkshade",
            "--buffer-pages",
            "3",
            "view",
            "doc.pdf",
            "--scroll-by",
            "-120",
            "--scroll-by",
            "400",
        ])
        .unwrap();
        assert_eq!(args.buffer_pages, Some(3));
        match args.command {
            Cmd::View(view) => assert_eq!(view.scroll_by, vec![-120.0, 400.0]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn select_requires_both_drag_points() {
        let result = Args::try_parse_from(["inkshade", "select", "doc.pdf", "--from", "1,2"]);
        assert!(result.is_err());
    }

    #[test]
    fn view_summary_includes_document_metadata() {
        let summary = ViewSummary {
            path: PathBuf::from("/docs/report.pdf"),
            metadata: DocumentMetadata {
                title: Some("Quarterly report".into()),
                author: Some("Finance".into()),
                keywords: vec!["q3".into()],
            },
            page_count: 12,
            current_page: 4,
            offset_in_page: 0.0,
            zoom_percent: 100,
            dark_mode: false,
            materialized: vec![3, 4, 5],
            failed_pages: vec![],
        };
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["title"], "Quarterly report");
        assert_eq!(value["author"], "Finance");
        assert_eq!(value["keywords"][0], "q3");
        assert_eq!(value["current_page"], 4);
    }
}
