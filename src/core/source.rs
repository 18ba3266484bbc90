use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Well-known source kinds, mirroring what the playlist/UI collaborators
/// hand us. Kept as strings because collaborators may define new kinds.
pub const KIND_URL: &str = "urlsource";
pub const KIND_DVD: &str = "dvdsource";
pub const KIND_VCD: &str = "vcdsource";
pub const KIND_TV: &str = "tvsource";
pub const KIND_AUDIOCD: &str = "audiocdsource";
pub const KIND_PIPE: &str = "pipesource";

/// One playable entry of a source. A source holding a playlist-like
/// stream can carry several of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub url: String,
    pub playable: bool,
}

impl SourceItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            playable: true,
        }
    }
}

/// Description of what to play, owned by a collaborator (the UI source
/// page) and shared with the coordinator. The coordinator and the bound
/// backend only ever hold a [`SharedSource`] clone, never the object
/// itself.
///
/// Positions and lengths are in deciseconds.
#[derive(Debug)]
pub struct Source {
    pub kind: String,
    pub mime_type: Option<String>,
    pub sub_url: Option<String>,
    pub audio_device: Option<String>,
    pub video_device: Option<String>,
    pub norm: Option<String>,
    /// Tuner frequency in kHz; 0 for non-tuner sources.
    pub frequency: u32,
    /// Producer command piped into the player for pipe sources.
    pub pipe_cmd: Option<String>,
    /// Target file for recorder/dumper backends.
    pub record_file: Option<PathBuf>,
    options: String,
    record_options: String,
    position: u64,
    length: u64,
    width: u32,
    height: u32,
    aspect: f32,
    seekable: bool,
    items: Vec<SourceItem>,
    current: usize,
    active: bool,
}

pub type SharedSource = Arc<Mutex<Source>>;

impl Source {
    pub fn new(kind: impl Into<String>, url: impl Into<String>) -> Self {
        let kind = kind.into();
        // Live inputs cannot be repositioned.
        let seekable = !matches!(kind.as_str(), KIND_TV | KIND_PIPE);
        Self {
            kind,
            mime_type: None,
            sub_url: None,
            audio_device: None,
            video_device: None,
            norm: None,
            frequency: 0,
            pipe_cmd: None,
            record_file: None,
            options: String::new(),
            record_options: String::new(),
            position: 0,
            length: 0,
            width: 0,
            height: 0,
            aspect: 0.0,
            seekable,
            items: vec![SourceItem::new(url)],
            current: 0,
            active: false,
        }
    }

    pub fn shared(self) -> SharedSource {
        Arc::new(Mutex::new(self))
    }

    /// Url of the current item, falling back to the first playable one.
    pub fn url(&self) -> String {
        self.current_item()
            .map(|i| i.url.clone())
            .unwrap_or_default()
    }

    pub fn current_item(&self) -> Option<&SourceItem> {
        self.items
            .get(self.current)
            .filter(|i| i.playable)
            .or_else(|| self.items.iter().find(|i| i.playable))
    }

    /// Selects `item` as the current one if the source knows it;
    /// otherwise appends it first. Used when a deferred back-request is
    /// finally served.
    pub fn select_item(&mut self, item: &SourceItem) {
        match self.items.iter().position(|i| i.url == item.url) {
            Some(idx) => self.current = idx,
            None => {
                self.items.push(item.clone());
                self.current = self.items.len() - 1;
            }
        }
        self.position = 0;
    }

    /// Advances to the next playable item, if any.
    pub fn next_item(&mut self) -> bool {
        let offset = self
            .items
            .iter()
            .skip(self.current + 1)
            .position(|i| i.playable);
        match offset {
            Some(offset) => {
                self.current += 1 + offset;
                self.position = 0;
                true
            }
            None => false,
        }
    }

    /// Inserts an alternate url discovered inside the stream (playlist
    /// redirects) right after the current item.
    pub fn insert_url(&mut self, url: impl Into<String>) {
        let url = url.into();
        if self.items.iter().any(|i| i.url == url) {
            return;
        }
        log::debug!("source: discovered alternate url {}", url);
        self.items.insert(self.current + 1, SourceItem::new(url));
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn set_options(&mut self, options: impl Into<String>) {
        self.options = options.into();
    }

    pub fn record_options(&self) -> &str {
        &self.record_options
    }

    pub fn set_record_options(&mut self, options: impl Into<String>) {
        self.record_options = options.into();
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn has_length(&self) -> bool {
        self.length > 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn set_length(&mut self, length: u64) {
        self.length = length;
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn aspect(&self) -> f32 {
        self.aspect
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if aspect > 0.001 {
            self.aspect = aspect;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.reset();
    }

    /// Clears the live playback fields; identity fields stay.
    pub fn reset(&mut self) {
        self.position = 0;
        self.width = 0;
        self.height = 0;
        self.aspect = 0.0;
    }
}
