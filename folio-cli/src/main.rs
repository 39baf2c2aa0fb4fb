use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use folio_core::{HighlightRange, RecordingDisplay, Viewer, ViewerEvent, ViewerOptions};
use folio_remote::{
    pump_until_idle, HttpDocumentSource, RemoteConfig, ResourceFetcher, RetryPolicy,
};
use serde::Deserialize;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "inspect paginated documents served by a folio layout service"
)]
struct Args {
    /// Identifier of the document to open
    document_id: String,

    /// Base URL of the layout service
    #[arg(long = "base-url")]
    base_url: Option<String>,

    /// Extra request header as NAME=VALUE (repeatable)
    #[arg(long = "header", value_name = "NAME=VALUE")]
    headers: Vec<String>,

    /// Path to a TOML config file (defaults to the platform config directory)
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Page to open the document on
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Character offset to locate within the document
    #[arg(long = "locate")]
    locate: Option<u64>,

    /// Highlight a character range given as START:END
    #[arg(long = "highlight", value_name = "START:END")]
    highlight: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    viewer: ViewerOptions,
    remote: RemoteConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let project_dirs = ProjectDirs::from("net", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let mut config = load_config(args.config.as_ref(), &project_dirs)?;
    if let Some(base_url) = args.base_url {
        config.remote.base_url = base_url;
    }
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        config.remote.headers.insert(name, value);
    }
    if let Some(page) = args.page {
        config.viewer.page_number = page;
    }

    let source = Arc::new(HttpDocumentSource::new(&config.remote)?);
    let policy = RetryPolicy::from_config(&config.remote);
    let mut fetcher = ResourceFetcher::new(source.clone(), policy);
    let mut viewer = Viewer::new(RecordingDisplay::new(), config.viewer);

    viewer
        .open_document(source.as_ref(), &args.document_id)
        .await
        .with_context(|| format!("failed to open document {}", args.document_id))?;
    layout_pages(&mut viewer);
    pump_until_idle(&mut viewer, &mut fetcher).await;
    for page in viewer.pages() {
        if page.failed {
            warn!(page = page.page_number, "page resources unavailable");
        }
    }

    print_document(&viewer);

    if let Some(offset) = args.locate {
        match viewer.locate_page(offset) {
            Ok(page_number) => println!("\noffset {offset} falls on page {page_number}"),
            Err(err) => println!("\noffset {offset}: {err}"),
        }
    }

    if let Some(raw) = args.highlight.as_deref() {
        let range = parse_highlight(raw)?;
        viewer.set_highlight_ranges(vec![range]);
        pump_until_idle(&mut viewer, &mut fetcher).await;
        print_highlights(&viewer);
    }

    print_page_tree(&viewer);
    print_events(&viewer);
    Ok(())
}

fn layout_pages(viewer: &mut Viewer<RecordingDisplay>) {
    let geometry: Vec<_> = viewer
        .pages()
        .iter()
        .map(|page| (page.container(), page.width, page.height))
        .collect();
    let viewport_height = viewer.pages().first().map(|page| page.height).unwrap_or(0.0);
    let mut top = 0.0;
    for (container, width, height) in geometry {
        viewer.display_mut().place_node(container, top, width, height);
        top += height;
    }
    viewer.display_mut().set_viewport_height(viewport_height);
    viewer.handle_resize();
}

fn print_document(viewer: &Viewer<RecordingDisplay>) {
    if let Some(info) = viewer.document() {
        println!("Document");
        println!("  id:    {}", info.id);
        println!("  title: {}", info.display_title());
        println!("  file:  {}", info.filename);
        println!("  pages: {}", viewer.page_count());
    }
    println!("\nPages");
    for page in viewer.pages() {
        let state = if page.failed {
            "failed"
        } else if page.image_loaded && page.layout_loaded {
            "ready"
        } else if page.active {
            "loading"
        } else {
            "idle"
        };
        println!(
            "  page {:>3}: {:>7.1} x {:<7.1} span {:>6}..{:<6} {}",
            page.page_number, page.width, page.height, page.span.start, page.span.end, state
        );
    }
}

fn print_page_tree(viewer: &Viewer<RecordingDisplay>) {
    let Some(page) = viewer.page(viewer.page_number()) else {
        return;
    };
    let Some(layout) = page.layout.as_ref() else {
        println!("\npage {} layout unavailable", page.page_number);
        return;
    };
    println!(
        "\nPage {} ({} x {}, span {}..{})",
        page.page_number, layout.width, layout.height, layout.span.start, layout.span.end
    );
    for (index, block) in layout.blocks.iter().enumerate() {
        println!(
            "  block {} span {}..{}",
            index + 1,
            block.span.start,
            block.span.end
        );
        for line in &block.lines {
            let text: Vec<&str> = line.words.iter().map(|word| word.text.as_str()).collect();
            println!("    {:>6}..{:<6} {}", line.span.start, line.span.end, text.join(" "));
        }
    }
}

fn print_highlights(viewer: &Viewer<RecordingDisplay>) {
    let Some(page) = viewer.page(viewer.page_number()) else {
        return;
    };
    let emphasized = page
        .word_overlays()
        .iter()
        .filter(|id| {
            viewer
                .display()
                .node(**id)
                .map_or(false, |node| node.emphasis.is_some())
        })
        .count();
    println!(
        "\n{} highlighted word(s) on page {}",
        emphasized,
        viewer.page_number()
    );
}

fn print_events(viewer: &Viewer<RecordingDisplay>) {
    let events = viewer.events();
    let events = events.lock();
    if events.is_empty() {
        return;
    }
    println!("\nEvents");
    for event in events.iter() {
        match event {
            ViewerEvent::PageChanged { page_number } => {
                println!("  page changed to {page_number}")
            }
            ViewerEvent::HighlightsChanged { count } => {
                println!("  highlights changed ({count} range(s))")
            }
            ViewerEvent::NavigationFailed { offset } => {
                println!("  navigation to offset {offset} failed")
            }
            ViewerEvent::PageLoadFailed {
                page_number,
                resource,
            } => println!("  page {page_number} failed to load {resource:?}"),
        }
    }
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("header {raw:?} is not in NAME=VALUE form");
    };
    Ok((name.trim().to_string(), value.trim().to_string()))
}

fn parse_highlight(raw: &str) -> Result<HighlightRange> {
    let Some((start, end)) = raw.split_once(':') else {
        bail!("highlight {raw:?} is not in START:END form");
    };
    let start: u64 = start
        .trim()
        .parse()
        .with_context(|| format!("invalid highlight start {start:?}"))?;
    let end: u64 = end
        .trim()
        .parse()
        .with_context(|| format!("invalid highlight end {end:?}"))?;
    if end < start {
        bail!("highlight range {raw:?} ends before it starts");
    }
    Ok(HighlightRange {
        start,
        end,
        color: None,
    })
}

fn load_config(explicit: Option<&PathBuf>, project_dirs: &ProjectDirs) -> Result<ConfigFile> {
    let path = match explicit {
        Some(path) => path.clone(),
        None => {
            let default = project_dirs.config_dir().join("config.toml");
            if !default.exists() {
                return Ok(ConfigFile::default());
            }
            default
        }
    };
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read config {:?}", path))?;
    toml::from_str(&raw).with_context(|| format!("invalid config {:?}", path))
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer();

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
    fn headers_parse_as_name_value_pairs() {
        assert_eq!(
            parse_header("Authorization=Bearer abc").unwrap(),
            ("Authorization".to_string(), "Bearer abc".to_string())
        );
        assert_eq!(
            parse_header("X-Tag=a=b").unwrap(),
            ("X-Tag".to_string(), "a=b".to_string())
        );
        assert!(parse_header("no-separator").is_err());
    }

    #[test]
    fn highlight_ranges_parse_from_colon_form() {
        let range = parse_highlight("10:25").unwrap();
        assert_eq!(range.start, 10);
        assert_eq!(range.end, 25);
        assert!(range.color.is_none());

        assert!(parse_highlight("25:10").is_err());
        assert!(parse_highlight("ten:20").is_err());
        assert!(parse_highlight("10-20").is_err());
    }

    #[test]
    fn config_file_overrides_defaults_per_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[viewer]
prefetch_pages = 4
scroll_update_interval_ms = 250

[remote]
base_url = "http://gateway.test/folio"
retry_attempts = 5
"#,
        )
        .unwrap();

        let project_dirs = ProjectDirs::from("net", "folio", "folio-cli-tests").unwrap();
        let config = load_config(Some(&path), &project_dirs).unwrap();
        assert_eq!(config.viewer.prefetch_pages, 4);
        assert_eq!(
            config.viewer.scroll_update_interval,
            std::time::Duration::from_millis(250)
        );
        assert_eq!(config.remote.base_url, "http://gateway.test/folio");
        assert_eq!(config.remote.retry_attempts, 5);
        // fields absent from the file keep their defaults
        assert_eq!(config.viewer.page_number, 1);
        assert_eq!(config.remote.retry_base_delay_ms, 250);
    }

    #[test]
    fn explicit_config_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        let project_dirs = ProjectDirs::from("net", "folio", "folio-cli-tests").unwrap();
        assert!(load_config(Some(&path), &project_dirs).is_err());
    }
}
