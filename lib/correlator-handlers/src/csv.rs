//! Writes one CSV row per event under `output_directory/<fq-id>.csv`,
//! one file per event kind. The first row written to a fresh file is a
//! header naming the kind's schema fields (plus `timestamp` and `system`);
//! every later row to that file just appends.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use correlator_config::ConfigStore;
use correlator_event::Event;
use correlator_reactor::{Handler, HandlerError, HandlerRegistration, SecretProvider};

inventory::submit! {
    HandlerRegistration {
        id: "csv",
        constructor: |name| Box::new(CsvHandler::new(name, CsvConfig::default())),
    }
}

#[derive(Debug, Clone)]
pub struct CsvConfig {
    pub output_directory: PathBuf,
    /// How many rotated generations to keep (`None` disables rotation: the
    /// file just keeps growing).
    pub rotate_files: Option<u32>,
    /// Whether to hold file handles open across events rather than
    /// reopening per write. Either way the visible CSV content is identical.
    pub cache_filehandles: bool,
    pub enabled: bool,
}

impl Default for CsvConfig {
    fn default() -> Self {
        CsvConfig {
            output_directory: PathBuf::from("."),
            rotate_files: None,
            cache_filehandles: false,
            enabled: true,
        }
    }
}

pub struct CsvHandler {
    name: String,
    config: CsvConfig,
    seen_files: HashMap<String, bool>,
    open_handles: HashMap<String, File>,
}

impl CsvHandler {
    pub fn new(name: impl Into<String>, config: CsvConfig) -> Self {
        CsvHandler {
            name: name.into(),
            config,
            seen_files: HashMap::new(),
            open_handles: HashMap::new(),
        }
    }

    fn path_for(&self, fq_id: &str) -> PathBuf {
        self.config.output_directory.join(format!("{fq_id}.csv"))
    }

    fn row_for(&self, event: &Event) -> Vec<String> {
        let mut row = vec![event.timestamp.to_string(), event.system.clone()];
        for field in event.kind.field_names() {
            let rendered = event
                .payload
                .get(field)
                .map(|v| v.as_display())
                .unwrap_or_default();
            row.push(rendered);
        }
        row
    }

    fn header_for(&self, event: &Event) -> Vec<String> {
        let mut header = vec!["timestamp".to_string(), "system".to_string()];
        header.extend(event.kind.field_names().into_iter().map(str::to_string));
        header
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn write_row(file: &mut File, row: &[String]) -> std::io::Result<()> {
    let line = row.iter().map(|f| csv_escape(f)).collect::<Vec<_>>().join(",");
    writeln!(file, "{line}")
}

/// Renames `path` to `path_1`, the old `path_1` to `path_2`, ... dropping
/// whatever falls past `keep` generations.
fn rotate(path: &Path, keep: u32) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for generation in (1..keep).rev() {
        let src = rotated_path(path, generation);
        let dst = rotated_path(path, generation + 1);
        if src.exists() {
            std::fs::rename(&src, &dst)?;
        }
    }
    std::fs::rename(path, rotated_path(path, 1))
}

fn rotated_path(base: &Path, generation: u32) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = base
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default();
    base.with_file_name(format!("{stem}_{generation}.{ext}"))
}

impl Handler for CsvHandler {
    fn handler_name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, config: &ConfigStore, _secrets: &dyn SecretProvider) -> Result<(), HandlerError> {
        let prefix = format!("handler.{}", self.name);
        if let Some(dir) = config.get(&format!("{prefix}.output_directory")).ok().and_then(|v| v.as_str().map(str::to_string)) {
            self.config.output_directory = PathBuf::from(dir);
        }
        if let Some(rotate) = config.get(&format!("{prefix}.rotate_files")).ok().and_then(|v| v.as_i64()) {
            self.config.rotate_files = (rotate > 0).then_some(rotate as u32);
        }
        if let Some(cached) = config.get(&format!("{prefix}.cache_filehandles")).ok().and_then(|v| v.as_bool()) {
            self.config.cache_filehandles = cached;
        }
        if let Some(enabled) = config.get(&format!("{prefix}.enabled")).ok().and_then(|v| v.as_bool()) {
            self.config.enabled = enabled;
        }
        Ok(())
    }

    fn process_event(&mut self, event: &Event) -> Result<(), HandlerError> {
        if !self.config.enabled {
            return Ok(());
        }

        let fq_id = event.fq_id();
        let path = self.path_for(&fq_id);
        let first_write = !self.seen_files.contains_key(&fq_id);

        if first_write {
            self.seen_files.insert(fq_id.clone(), true);
            if let Some(keep) = self.config.rotate_files {
                rotate(&path, keep).map_err(|error| HandlerError::SimpleException {
                    message: format!("could not rotate {}: {error}", path.display()),
                })?;
            }
        }

        let needs_header = first_write && !path.exists();

        let result = if self.config.cache_filehandles {
            if !self.open_handles.contains_key(&fq_id) {
                let file = open_for_append(&path).map_err(to_handler_error)?;
                self.open_handles.insert(fq_id.clone(), file);
            }
            let header = needs_header.then(|| self.header_for(event));
            let row = self.row_for(event);
            let file = self.open_handles.get_mut(&fq_id).unwrap();
            if let Some(header) = header {
                write_row(file, &header).map_err(to_handler_error)?;
            }
            write_row(file, &row).map_err(to_handler_error)
        } else {
            let mut file = open_for_append(&path).map_err(to_handler_error)?;
            if needs_header {
                write_row(&mut file, &self.header_for(event)).map_err(to_handler_error)?;
            }
            write_row(&mut file, &self.row_for(event)).map_err(to_handler_error)
        };
        result
    }
}

fn open_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn to_handler_error(error: std::io::Error) -> HandlerError {
    HandlerError::SimpleException {
        message: error.to_string(),
    }
}
