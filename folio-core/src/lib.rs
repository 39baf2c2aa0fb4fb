use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub type DocumentId = String;

pub const LAYOUT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_EMPHASIS_COLOR: &str = "#fea";
pub const PRIMARY_BUTTON: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub filename: String,
    pub meta: DocumentMetadata,
}

impl DocumentInfo {
    pub fn display_title(&self) -> &str {
        self.meta
            .title
            .as_deref()
            .filter(|title| !title.is_empty())
            .unwrap_or(&self.filename)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub bbox: Bbox,
    pub text: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub bbox: Bbox,
    pub words: Vec<Word>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub bbox: Bbox,
    pub lines: Vec<Line>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageLayout {
    pub width: f64,
    pub height: f64,
    pub span: Span,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionedLayoutRecord {
    pub version: u32,
    pub width: f64,
    pub height: f64,
    pub span: Span,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyLayoutRecord(f64, f64, Vec<LegacyBlockRecord>, (u64, u64));

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyBlockRecord([f64; 4], Vec<LegacyLineRecord>, (u64, u64));

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyLineRecord([f64; 4], Vec<LegacyWordRecord>, (u64, u64));

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyWordRecord([f64; 4], String, (u64, u64));

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LayoutRecord {
    Versioned(VersionedLayoutRecord),
    Legacy(LegacyLayoutRecord),
}

impl LayoutRecord {
    pub fn into_layout(self) -> Result<PageLayout, ViewerError> {
        match self {
            LayoutRecord::Versioned(record) => {
                if record.version != LAYOUT_SCHEMA_VERSION {
                    return Err(ViewerError::UnsupportedLayoutVersion {
                        version: record.version,
                    });
                }
                Ok(PageLayout {
                    width: record.width,
                    height: record.height,
                    span: record.span,
                    blocks: record.blocks,
                })
            }
            LayoutRecord::Legacy(record) => Ok(record.into_layout()),
        }
    }
}

impl LegacyLayoutRecord {
    fn into_layout(self) -> PageLayout {
        let LegacyLayoutRecord(width, height, blocks, span) = self;
        PageLayout {
            width,
            height,
            span: span_from_pair(span),
            blocks: blocks.into_iter().map(LegacyBlockRecord::into_block).collect(),
        }
    }
}

impl LegacyBlockRecord {
    fn into_block(self) -> Block {
        let LegacyBlockRecord(bbox, lines, span) = self;
        Block {
            bbox: bbox_from_corners(bbox),
            lines: lines.into_iter().map(LegacyLineRecord::into_line).collect(),
            span: span_from_pair(span),
        }
    }
}

impl LegacyLineRecord {
    fn into_line(self) -> Line {
        let LegacyLineRecord(bbox, words, span) = self;
        Line {
            bbox: bbox_from_corners(bbox),
            words: words.into_iter().map(LegacyWordRecord::into_word).collect(),
            span: span_from_pair(span),
        }
    }
}

impl LegacyWordRecord {
    fn into_word(self) -> Word {
        let LegacyWordRecord(bbox, text, span) = self;
        Word {
            bbox: bbox_from_corners(bbox),
            text,
            span: span_from_pair(span),
        }
    }
}

fn bbox_from_corners(corners: [f64; 4]) -> Bbox {
    Bbox {
        x1: corners[0],
        y1: corners[1],
        x2: corners[2],
        y2: corners[3],
    }
}

fn span_from_pair(pair: (u64, u64)) -> Span {
    Span {
        start: pair.0,
        end: pair.1,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSummary {
    pub width: f64,
    pub height: f64,
    pub span: Span,
}

pub fn spans_are_monotonic(summaries: &[PageSummary]) -> bool {
    summaries
        .windows(2)
        .all(|pair| pair[0].span.end < pair[1].span.start)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

pub fn interval_overlap(a: Interval, b: Interval) -> f64 {
    if a.min > b.max || b.min > a.max {
        0.0
    } else {
        a.max.min(b.max) - a.min.max(b.min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    pub fn from_corners(a: Point, b: Point) -> Self {
        Self {
            x: a.x.min(b.x),
            y: a.y.min(b.y),
            width: (a.x - b.x).abs(),
            height: (a.y - b.y).abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Placement {
    pub fn normalized(bbox: Bbox, page_width: f64, page_height: f64) -> Self {
        Self {
            left: bbox.x1 / page_width,
            top: bbox.y1 / page_height,
            width: (bbox.x2 - bbox.x1) / page_width,
            height: (bbox.y2 - bbox.y1) / page_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightRange {
    pub start: u64,
    pub end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emphasis {
    pub color: String,
}

pub fn emphasis_for(ranges: &[HighlightRange], word_start: u64) -> Option<Emphasis> {
    ranges
        .iter()
        .find(|range| range.start <= word_start && word_start <= range.end)
        .map(|range| Emphasis {
            color: range
                .color
                .clone()
                .unwrap_or_else(|| DEFAULT_EMPHASIS_COLOR.to_string()),
        })
}

pub fn should_highlight(ranges: &[HighlightRange], word_start: u64) -> bool {
    emphasis_for(ranges, word_start).is_some()
}

#[derive(Debug, Error, PartialEq)]
pub enum ViewerError {
    #[error("character offset {offset} is outside every page span")]
    OffsetOutOfBounds { offset: u64 },
    #[error("page {page} out of range (document has {count} pages)")]
    PageOutOfRange { page: usize, count: usize },
    #[error("unsupported layout schema version {version}")]
    UnsupportedLayoutVersion { version: u32 },
    #[error("no document is open")]
    DocumentNotOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Image,
    Layout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    PageChanged { page_number: usize },
    HighlightsChanged { count: usize },
    NavigationFailed { offset: u64 },
    PageLoadFailed { page_number: usize, resource: ResourceKind },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub document_id: DocumentId,
    pub page_number: usize,
    pub kind: ResourceKind,
    pub generation: u64,
}

#[derive(Debug)]
pub enum FetchPayload {
    Image(Bytes),
    Layout(LayoutRecord),
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub page_number: usize,
    pub kind: ResourceKind,
    pub generation: u64,
    pub payload: Result<FetchPayload>,
}

#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_document_meta(&self, id: &str) -> Result<DocumentInfo>;
    async fn fetch_page_spans(&self, id: &str) -> Result<Vec<PageSummary>>;
    async fn fetch_page_image(&self, id: &str, page_number: usize) -> Result<Bytes>;
    async fn fetch_page_layout(&self, id: &str, page_number: usize) -> Result<LayoutRecord>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    PagesRoot,
    Page,
    LoadingLayer,
    FailureLayer,
    PageImage,
    TextLayer,
    BlockOverlay,
    LineOverlay,
    WordOverlay,
    DragOverlay,
}

pub trait DisplayTree {
    fn create_node(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId;
    fn remove_node(&mut self, id: NodeId);
    fn set_placement(&mut self, id: NodeId, placement: Placement);
    fn set_frame(&mut self, id: NodeId, frame: Rect);
    fn set_visible(&mut self, id: NodeId, visible: bool);
    fn set_emphasis(&mut self, id: NodeId, emphasis: Option<Emphasis>);
    fn set_image(&mut self, id: NodeId, data: Bytes);
    fn node_rect(&self, id: NodeId) -> Rect;
    fn viewport_height(&self) -> f64;
    fn scroll_top(&self) -> f64;
    fn scroll_into_view(&mut self, id: NodeId);
}

#[derive(Debug, Clone)]
pub struct RecordedNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
    pub placement: Option<Placement>,
    pub frame: Option<Rect>,
    pub visible: bool,
    pub emphasis: Option<Emphasis>,
    pub image: Option<Bytes>,
    layout_top: f64,
    layout_width: f64,
    layout_height: f64,
}

#[derive(Debug, Default)]
pub struct RecordingDisplay {
    nodes: BTreeMap<NodeId, RecordedNode>,
    next_id: u64,
    viewport_height: f64,
    scroll_top: f64,
    scrolled_into_view: Vec<NodeId>,
}

impl RecordingDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_viewport_height(&mut self, height: f64) {
        self.viewport_height = height;
    }

    pub fn set_scroll_top(&mut self, value: f64) {
        self.scroll_top = value;
    }

    pub fn place_node(&mut self, id: NodeId, top: f64, width: f64, height: f64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.layout_top = top;
            node.layout_width = width;
            node.layout_height = height;
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&RecordedNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> Vec<&RecordedNode> {
        self.nodes.values().filter(|node| node.kind == kind).collect()
    }

    pub fn children_of(&self, id: NodeId) -> Vec<&RecordedNode> {
        self.nodes
            .values()
            .filter(|node| node.parent == Some(id))
            .collect()
    }

    pub fn scrolled_into_view(&self) -> &[NodeId] {
        &self.scrolled_into_view
    }
}

impl DisplayTree for RecordingDisplay {
    fn create_node(&mut self, parent: Option<NodeId>, kind: NodeKind) -> NodeId {
        self.next_id += 1;
        let id = NodeId(self.next_id);
        self.nodes.insert(
            id,
            RecordedNode {
                id,
                parent,
                kind,
                placement: None,
                frame: None,
                visible: true,
                emphasis: None,
                image: None,
                layout_top: 0.0,
                layout_width: 0.0,
                layout_height: 0.0,
            },
        );
        id
    }

    fn remove_node(&mut self, id: NodeId) {
        let mut doomed = vec![id];
        let mut index = 0;
        while index < doomed.len() {
            let current = doomed[index];
            index += 1;
            let children: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|node| node.parent == Some(current))
                .map(|node| node.id)
                .collect();
            doomed.extend(children);
        }
        for node in doomed {
            self.nodes.remove(&node);
        }
    }

    fn set_placement(&mut self, id: NodeId, placement: Placement) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.placement = Some(placement);
        }
    }

    fn set_frame(&mut self, id: NodeId, frame: Rect) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.frame = Some(frame);
        }
    }

    fn set_visible(&mut self, id: NodeId, visible: bool) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.visible = visible;
        }
    }

    fn set_emphasis(&mut self, id: NodeId, emphasis: Option<Emphasis>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.emphasis = emphasis;
        }
    }

    fn set_image(&mut self, id: NodeId, data: Bytes) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.image = Some(data);
        }
    }

    fn node_rect(&self, id: NodeId) -> Rect {
        match self.nodes.get(&id) {
            Some(node) => Rect {
                x: 0.0,
                y: node.layout_top - self.scroll_top,
                width: node.layout_width,
                height: node.layout_height,
            },
            None => Rect::default(),
        }
    }

    fn viewport_height(&self) -> f64 {
        self.viewport_height
    }

    fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    fn scroll_into_view(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get(&id) {
            self.scroll_top = node.layout_top;
        }
        self.scrolled_into_view.push(id);
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerOptions {
    pub page_number: usize,
    // pages loaded ahead of and behind the active page
    pub prefetch_pages: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "scroll_update_interval_ms")]
    pub scroll_update_interval: Duration,
    pub draw_word_overlay: bool,
    pub draw_line_overlay: bool,
    pub draw_block_overlay: bool,
    pub highlight_ranges: Vec<HighlightRange>,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            page_number: 1,
            prefetch_pages: 2,
            scroll_update_interval: Duration::from_millis(100),
            draw_word_overlay: true,
            draw_line_overlay: false,
            draw_block_overlay: true,
            highlight_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateOptions {
    pub page_number: Option<usize>,
    pub highlight_ranges: Option<Vec<HighlightRange>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PagePoint {
    pub page_number: usize,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug)]
pub struct PageRuntime {
    pub page_number: usize,
    pub width: f64,
    pub height: f64,
    pub span: Span,
    pub active: bool,
    pub loading: bool,
    pub failed: bool,
    pub image_loaded: bool,
    pub layout_loaded: bool,
    pub text_layer_rendered: bool,
    pub layout: Option<Arc<PageLayout>>,
    pub offset_height: f64,
    // bumped by every unload; completions carrying an older value are dropped
    generation: u64,
    container: NodeId,
    loading_layer: NodeId,
    failure_layer: Option<NodeId>,
    image_node: Option<NodeId>,
    text_layer: Option<NodeId>,
    block_overlays: Vec<NodeId>,
    line_overlays: Vec<NodeId>,
    word_overlays: Vec<NodeId>,
}

impl PageRuntime {
    fn new(page_number: usize, summary: &PageSummary, container: NodeId, loading_layer: NodeId) -> Self {
        Self {
            page_number,
            width: summary.width,
            height: summary.height,
            span: summary.span,
            active: false,
            loading: false,
            failed: false,
            image_loaded: false,
            layout_loaded: false,
            text_layer_rendered: false,
            layout: None,
            offset_height: 0.0,
            generation: 0,
            container,
            loading_layer,
            failure_layer: None,
            image_node: None,
            text_layer: None,
            block_overlays: Vec::new(),
            line_overlays: Vec::new(),
            word_overlays: Vec::new(),
        }
    }

    pub fn container(&self) -> NodeId {
        self.container
    }

    pub fn loading_layer(&self) -> NodeId {
        self.loading_layer
    }

    pub fn failure_layer(&self) -> Option<NodeId> {
        self.failure_layer
    }

    pub fn image_node(&self) -> Option<NodeId> {
        self.image_node
    }

    pub fn text_layer(&self) -> Option<NodeId> {
        self.text_layer
    }

    pub fn block_overlays(&self) -> &[NodeId] {
        &self.block_overlays
    }

    pub fn line_overlays(&self) -> &[NodeId] {
        &self.line_overlays
    }

    pub fn word_overlays(&self) -> &[NodeId] {
        &self.word_overlays
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

pub struct Viewer<D: DisplayTree> {
    display: D,
    options: ViewerOptions,
    document: Option<DocumentInfo>,
    pages: Vec<PageRuntime>,
    page_number: usize,
    highlight_ranges: Vec<HighlightRange>,
    viewport_height: f64,
    last_scroll_update: Option<Instant>,
    dragging: bool,
    drag_start: Option<PagePoint>,
    drag_end: Option<PagePoint>,
    pages_root: NodeId,
    drag_overlay: NodeId,
    fetch_outbox: Vec<FetchRequest>,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
    page_change_listener: Option<Box<dyn Fn(usize) + Send>>,
}

impl<D: DisplayTree> Viewer<D> {
    pub fn new(mut display: D, options: ViewerOptions) -> Self {
        let pages_root = display.create_node(None, NodeKind::PagesRoot);
        let drag_overlay = display.create_node(None, NodeKind::DragOverlay);
        display.set_visible(drag_overlay, false);
        let page_number = options.page_number;
        let highlight_ranges = options.highlight_ranges.clone();
        Self {
            display,
            options,
            document: None,
            pages: Vec::new(),
            page_number,
            highlight_ranges,
            viewport_height: 0.0,
            last_scroll_update: None,
            dragging: false,
            drag_start: None,
            drag_end: None,
            pages_root,
            drag_overlay,
            fetch_outbox: Vec::new(),
            events: Arc::new(Mutex::new(Vec::new())),
            page_change_listener: None,
        }
    }

    pub fn options(&self) -> &ViewerOptions {
        &self.options
    }

    pub fn document(&self) -> Option<&DocumentInfo> {
        self.document.as_ref()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn highlight_ranges(&self) -> &[HighlightRange] {
        &self.highlight_ranges
    }

    pub fn pages(&self) -> &[PageRuntime] {
        &self.pages
    }

    pub fn page(&self, page_number: usize) -> Option<&PageRuntime> {
        self.pages.get(page_number.checked_sub(1)?)
    }

    pub fn is_dragging(&self) -> bool {
        self.dragging
    }

    pub fn drag_overlay(&self) -> NodeId {
        self.drag_overlay
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn display_mut(&mut self) -> &mut D {
        &mut self.display
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn take_events(&self) -> Vec<ViewerEvent> {
        self.events.lock().drain(..).collect()
    }

    pub fn on_page_change<F>(&mut self, listener: F)
    where
        F: Fn(usize) + Send + 'static,
    {
        self.page_change_listener = Some(Box::new(listener));
    }

    pub fn take_fetch_requests(&mut self) -> Vec<FetchRequest> {
        std::mem::take(&mut self.fetch_outbox)
    }

    #[instrument(skip(self, source))]
    pub async fn open_document(&mut self, source: &dyn DocumentSource, document_id: &str) -> Result<()> {
        let info = source
            .fetch_document_meta(document_id)
            .await
            .with_context(|| format!("failed to fetch metadata for document {document_id}"))?;
        let summaries = source
            .fetch_page_spans(document_id)
            .await
            .with_context(|| format!("failed to fetch page spans for document {document_id}"))?;
        if !spans_are_monotonic(&summaries) {
            warn!(document = document_id, "page spans overlap or regress");
        }

        self.reset_pages();
        self.document = Some(info);
        for (index, summary) in summaries.iter().enumerate() {
            let container = self.display.create_node(Some(self.pages_root), NodeKind::Page);
            let loading_layer = self.display.create_node(Some(container), NodeKind::LoadingLayer);
            self.display.set_visible(loading_layer, false);
            self.pages
                .push(PageRuntime::new(index + 1, summary, container, loading_layer));
        }
        self.handle_resize();

        if !self.pages.is_empty() {
            let initial = self.options.page_number.clamp(1, self.pages.len());
            self.set_page_number(initial, true)?;
            self.handle_scroll();
        }
        Ok(())
    }

    pub fn detach(&mut self) {
        self.reset_pages();
        self.document = None;
        self.stop_drag();
        self.drag_start = None;
        self.drag_end = None;
        self.fetch_outbox.clear();
    }

    pub fn update(&mut self, options: UpdateOptions) -> Result<(), ViewerError> {
        if let Some(page_number) = options.page_number {
            if page_number != self.page_number {
                self.set_page_number(page_number, true)?;
            }
        }
        if let Some(ranges) = options.highlight_ranges {
            self.set_highlight_ranges(ranges);
        }
        Ok(())
    }

    pub fn set_page_number(&mut self, page_number: usize, scroll_into_view: bool) -> Result<(), ViewerError> {
        if self.pages.is_empty() {
            return Err(ViewerError::DocumentNotOpen);
        }
        if page_number < 1 || page_number > self.pages.len() {
            return Err(ViewerError::PageOutOfRange {
                page: page_number,
                count: self.pages.len(),
            });
        }
        if self.page_number == page_number && !scroll_into_view {
            return Ok(());
        }
        self.page_number = page_number;
        self.events
            .lock()
            .push(ViewerEvent::PageChanged { page_number });
        if let Some(listener) = &self.page_change_listener {
            listener(page_number);
        }

        let radius = self.options.prefetch_pages;
        for i in 1..=self.pages.len() {
            if page_number.saturating_sub(radius) <= i && i <= page_number + radius {
                self.load_page(i - 1);
            } else {
                self.unload_page(i - 1);
            }
        }

        if scroll_into_view {
            let container = self.pages[page_number - 1].container;
            self.display.scroll_into_view(container);
        }
        Ok(())
    }

    pub fn locate_page(&self, offset: u64) -> Result<usize, ViewerError> {
        for page in &self.pages {
            if page.span.contains(offset) {
                return Ok(page.page_number);
            }
        }
        Err(ViewerError::OffsetOutOfBounds { offset })
    }

    pub fn jump_to_location(&mut self, offset: u64) -> Result<(), ViewerError> {
        let page_number = self.locate_page(offset)?;
        self.set_page_number(page_number, true)
    }

    pub fn set_highlight_ranges(&mut self, ranges: Vec<HighlightRange>) {
        if ranges == self.highlight_ranges {
            return;
        }
        self.highlight_ranges = ranges;
        self.events.lock().push(ViewerEvent::HighlightsChanged {
            count: self.highlight_ranges.len(),
        });
        for idx in 0..self.pages.len() {
            if self.pages[idx].active {
                self.repaint_text_layer(idx);
            }
        }
        if let Some(first) = self.highlight_ranges.first().map(|range| range.start) {
            if let Err(err) = self.jump_to_location(first) {
                warn!(offset = first, error = %err, "highlight jump aborted");
                self.events
                    .lock()
                    .push(ViewerEvent::NavigationFailed { offset: first });
            }
        }
    }

    pub fn handle_scroll(&mut self) {
        self.handle_scroll_at(Instant::now());
    }

    // the page with the greatest viewport overlap becomes active
    pub fn handle_scroll_at(&mut self, now: Instant) {
        if let Some(last) = self.last_scroll_update {
            if now.duration_since(last) < self.options.scroll_update_interval {
                return;
            }
        }

        let scroll_top = self.display.scroll_top();
        let viewport = Interval {
            min: scroll_top,
            max: scroll_top + self.viewport_height,
        };

        let mut best: Option<(usize, f64)> = None;
        let mut offset_top = 0.0;
        for page in &self.pages {
            let limits = Interval {
                min: offset_top,
                max: offset_top + page.offset_height,
            };
            offset_top += page.offset_height;
            let overlap = interval_overlap(viewport, limits);
            if overlap > 0.0 && best.map_or(true, |(_, best_overlap)| overlap > best_overlap) {
                best = Some((page.page_number, overlap));
            }
        }
        self.last_scroll_update = Some(now);

        if let Some((page_number, _)) = best {
            // page numbers taken from the page list are always in range
            let _ = self.set_page_number(page_number, false);
        }
    }

    // measuring heights on scroll forces a layout pass, so they are cached here
    pub fn handle_resize(&mut self) {
        self.viewport_height = self.display.viewport_height();
        for idx in 0..self.pages.len() {
            let rect = self.display.node_rect(self.pages[idx].container);
            self.pages[idx].offset_height = rect.height;
        }
    }

    pub fn handle_pointer_down(&mut self, x: f64, y: f64) {
        match self.page_at_point(x, y) {
            Some(point) => {
                self.drag_start = Some(point);
                self.start_drag();
            }
            None => self.stop_drag(),
        }
    }

    pub fn handle_pointer_move(&mut self, x: f64, y: f64, buttons: u32) {
        if !self.dragging {
            return;
        }
        if buttons & PRIMARY_BUTTON != 0 {
            self.drag_end = self.page_at_point(x, y);
            self.render_drag_overlay();
        } else {
            self.stop_drag();
        }
    }

    pub fn handle_pointer_up(&mut self, x: f64, y: f64) {
        self.drag_end = self.page_at_point(x, y);
        self.stop_drag();
    }

    pub fn apply_fetch_outcome(&mut self, outcome: FetchOutcome) {
        let Some(idx) = outcome.page_number.checked_sub(1) else {
            return;
        };
        if idx >= self.pages.len() {
            return;
        }
        if outcome.generation != self.pages[idx].generation {
            debug!(
                page = outcome.page_number,
                kind = ?outcome.kind,
                "dropping stale fetch completion"
            );
            return;
        }

        match outcome.payload {
            Ok(FetchPayload::Image(data)) => {
                if let Some(node) = self.pages[idx].image_node {
                    self.display.set_image(node, data);
                }
                self.pages[idx].image_loaded = true;
                self.display.set_visible(self.pages[idx].loading_layer, false);
                if self.pages[idx].layout_loaded {
                    self.pages[idx].loading = false;
                }
            }
            Ok(FetchPayload::Layout(record)) => match record.into_layout() {
                Ok(layout) => {
                    self.pages[idx].layout = Some(Arc::new(layout));
                    self.pages[idx].layout_loaded = true;
                    if self.pages[idx].image_loaded {
                        self.pages[idx].loading = false;
                    }
                    self.render_text_layer(idx);
                }
                Err(err) => {
                    warn!(
                        page = outcome.page_number,
                        error = %err,
                        "discarding malformed layout record"
                    );
                    self.fail_page(idx, ResourceKind::Layout);
                }
            },
            Err(err) => {
                warn!(
                    page = outcome.page_number,
                    kind = ?outcome.kind,
                    error = %err,
                    "page resource fetch failed"
                );
                self.fail_page(idx, outcome.kind);
            }
        }
    }

    fn load_page(&mut self, idx: usize) {
        self.pages[idx].active = true;
        if self.pages[idx].loading {
            return;
        }

        if self.pages[idx].layout_loaded && !self.pages[idx].text_layer_rendered {
            self.render_text_layer(idx);
        }

        if self.pages[idx].failed {
            self.pages[idx].failed = false;
            if let Some(layer) = self.pages[idx].failure_layer {
                self.display.set_visible(layer, false);
            }
        }

        // resources cached by an earlier load survive unloading and are not refetched
        let need_image = !self.pages[idx].image_loaded;
        let need_layout = !self.pages[idx].layout_loaded;
        if !need_image && !need_layout {
            return;
        }
        let Some(document_id) = self.document.as_ref().map(|doc| doc.id.clone()) else {
            return;
        };

        self.pages[idx].loading = true;
        self.pages[idx].generation += 1;
        let generation = self.pages[idx].generation;
        let page_number = self.pages[idx].page_number;
        self.display.set_visible(self.pages[idx].loading_layer, true);

        if self.pages[idx].image_node.is_none() {
            let container = self.pages[idx].container;
            let image_node = self.display.create_node(Some(container), NodeKind::PageImage);
            self.pages[idx].image_node = Some(image_node);
        }

        if need_image {
            self.fetch_outbox.push(FetchRequest {
                document_id: document_id.clone(),
                page_number,
                kind: ResourceKind::Image,
                generation,
            });
        }
        if need_layout {
            self.fetch_outbox.push(FetchRequest {
                document_id,
                page_number,
                kind: ResourceKind::Layout,
                generation,
            });
        }
    }

    fn unload_page(&mut self, idx: usize) {
        self.pages[idx].active = false;
        self.pages[idx].generation += 1;
        if self.pages[idx].loading {
            self.pages[idx].loading = false;
            self.display.set_visible(self.pages[idx].loading_layer, false);
        }
        if self.pages[idx].text_layer_rendered {
            self.pages[idx].block_overlays.clear();
            self.pages[idx].line_overlays.clear();
            self.pages[idx].word_overlays.clear();
            if let Some(layer) = self.pages[idx].text_layer.take() {
                self.display.remove_node(layer);
            }
            self.pages[idx].text_layer_rendered = false;
        }
    }

    fn repaint_text_layer(&mut self, idx: usize) {
        if let Some(layer) = self.pages[idx].text_layer.take() {
            self.display.remove_node(layer);
        }
        self.pages[idx].text_layer_rendered = false;
        self.load_page(idx);
    }

    fn render_text_layer(&mut self, idx: usize) {
        if self.pages[idx].text_layer_rendered {
            return;
        }
        let Some(layout) = self.pages[idx].layout.clone() else {
            return;
        };

        let container = self.pages[idx].container;
        let text_layer = self.display.create_node(Some(container), NodeKind::TextLayer);
        let mut block_overlays = Vec::new();
        let mut line_overlays = Vec::new();
        let mut word_overlays = Vec::new();

        for block in &layout.blocks {
            if self.options.draw_block_overlay {
                let node = self.display.create_node(Some(text_layer), NodeKind::BlockOverlay);
                self.display
                    .set_placement(node, Placement::normalized(block.bbox, layout.width, layout.height));
                block_overlays.push(node);
            }
            for line in &block.lines {
                if self.options.draw_line_overlay {
                    let node = self.display.create_node(Some(text_layer), NodeKind::LineOverlay);
                    self.display
                        .set_placement(node, Placement::normalized(line.bbox, layout.width, layout.height));
                    line_overlays.push(node);
                }
                for word in &line.words {
                    if !self.options.draw_word_overlay {
                        continue;
                    }
                    let node = self.display.create_node(Some(text_layer), NodeKind::WordOverlay);
                    self.display
                        .set_placement(node, Placement::normalized(word.bbox, layout.width, layout.height));
                    if let Some(emphasis) = emphasis_for(&self.highlight_ranges, word.span.start) {
                        self.display.set_emphasis(node, Some(emphasis));
                    }
                    word_overlays.push(node);
                }
            }
        }

        let page = &mut self.pages[idx];
        page.text_layer = Some(text_layer);
        page.block_overlays = block_overlays;
        page.line_overlays = line_overlays;
        page.word_overlays = word_overlays;
        page.text_layer_rendered = true;
    }

    fn fail_page(&mut self, idx: usize, resource: ResourceKind) {
        let page_number = self.pages[idx].page_number;
        self.pages[idx].loading = false;
        self.pages[idx].failed = true;
        self.display.set_visible(self.pages[idx].loading_layer, false);
        if self.pages[idx].failure_layer.is_none() {
            let container = self.pages[idx].container;
            let layer = self.display.create_node(Some(container), NodeKind::FailureLayer);
            self.pages[idx].failure_layer = Some(layer);
        }
        if let Some(layer) = self.pages[idx].failure_layer {
            self.display.set_visible(layer, true);
        }
        self.events.lock().push(ViewerEvent::PageLoadFailed {
            page_number,
            resource,
        });
    }

    fn start_drag(&mut self) {
        self.dragging = true;
        self.display.set_visible(self.drag_overlay, true);
    }

    fn stop_drag(&mut self) {
        self.dragging = false;
        self.display.set_visible(self.drag_overlay, false);
    }

    fn page_at_point(&self, x: f64, y: f64) -> Option<PagePoint> {
        for page in &self.pages {
            let rect = self.display.node_rect(page.container);
            if rect.contains(x, y) {
                return Some(PagePoint {
                    page_number: page.page_number,
                    x: x - rect.x,
                    y: y - rect.y,
                });
            }
        }
        None
    }

    fn page_to_container(&self, point: PagePoint) -> Option<Point> {
        let page = self.pages.get(point.page_number.checked_sub(1)?)?;
        let rect = self.display.node_rect(page.container);
        Some(Point {
            x: rect.x + point.x,
            y: rect.y + point.y,
        })
    }

    fn render_drag_overlay(&mut self) {
        let (Some(start), Some(end)) = (self.drag_start, self.drag_end) else {
            return;
        };
        let Some(a) = self.page_to_container(start) else {
            return;
        };
        let Some(b) = self.page_to_container(end) else {
            return;
        };
        let rect = Rect::from_corners(a, b);
        // anchored with the current scroll offset so it stays pinned while scrolling
        let frame = Rect {
            x: rect.x,
            y: self.display.scroll_top() + rect.y,
            width: rect.width,
            height: rect.height,
        };
        self.display.set_frame(self.drag_overlay, frame);
    }

    fn reset_pages(&mut self) {
        for idx in 0..self.pages.len() {
            let container = self.pages[idx].container;
            self.display.remove_node(container);
        }
        self.pages.clear();
    }
}
