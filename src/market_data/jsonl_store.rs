use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Datelike;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::warn;

use super::{CurrencyPair, MarginSettings, Quote, QuoteStore, SourceId};

/// Append-only JSONL persistence.
///
/// Layout under `base_path`:
/// - `quotes/{SOURCE}/{BASE-QUOTE}/{year}.jsonl`
/// - `margins/settings.jsonl`
pub struct JsonlQuoteStore {
    base_path: PathBuf,
}

impl JsonlQuoteStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn quotes_dir(&self, source: SourceId, pair: &CurrencyPair) -> PathBuf {
        self.base_path
            .join("quotes")
            .join(source.as_str())
            .join(pair.file_key())
    }

    fn quote_file(&self, source: SourceId, pair: &CurrencyPair, year: i32) -> PathBuf {
        self.quotes_dir(source, pair)
            .join(format!("{year:04}.jsonl"))
    }

    fn margins_file(&self) -> PathBuf {
        self.base_path.join("margins").join("settings.jsonl")
    }

    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create directory")?;
        }
        Ok(())
    }

    /// Valid rows of a JSONL file. Unparsable lines, such as a tail torn by a
    /// crash mid-append, are skipped with a warning.
    async fn read_jsonl<T: for<'de> serde::Deserialize<'de>>(&self, path: &Path) -> Result<Vec<T>> {
        let file = match fs::File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to open file"),
        };

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut items = Vec::new();

        while let Some(line) = lines.next_line().await.context("Failed to read line")? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(item) => items.push(item),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "skipping invalid JSONL line"
                ),
            }
        }

        Ok(items)
    }

    async fn append_jsonl<T: serde::Serialize>(&self, path: &Path, item: &T) -> Result<()> {
        self.ensure_dir(path).await?;

        let mut line = serde_json::to_string(item).context("Failed to serialize item")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
            .context("Failed to open file for append")?;

        // Start a fresh line if a previous append was torn.
        let len = file.metadata().await?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.insert(0, '\n');
            }
        }

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Year files for a key, in ascending year order.
    async fn year_files(&self, source: SourceId, pair: &CurrencyPair) -> Result<Vec<PathBuf>> {
        let dir = self.quotes_dir(source, pair);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to read quotes directory"),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait::async_trait]
impl QuoteStore for JsonlQuoteStore {
    async fn append_quote(&self, quote: &Quote) -> Result<()> {
        let path = self.quote_file(quote.source, &quote.pair, quote.fetched_at.year());
        self.append_jsonl(&path, quote)
            .await
            .with_context(|| format!("Failed to persist {} {} quote", quote.source, quote.pair))
    }

    async fn last_quote(&self, source: SourceId, pair: &CurrencyPair) -> Result<Option<Quote>> {
        // Newest year first; a later year file always wins over an earlier one.
        for path in self.year_files(source, pair).await?.into_iter().rev() {
            let quotes: Vec<Quote> = self.read_jsonl(&path).await?;
            if let Some(latest) = quotes.into_iter().max_by_key(|q| q.fetched_at) {
                return Ok(Some(latest));
            }
        }
        Ok(None)
    }

    async fn quote_history(&self, source: SourceId, pair: &CurrencyPair) -> Result<Vec<Quote>> {
        let mut all_quotes = Vec::new();
        for path in self.year_files(source, pair).await? {
            let quotes: Vec<Quote> = self.read_jsonl(&path).await?;
            all_quotes.extend(quotes);
        }
        all_quotes.sort_by_key(|q| q.fetched_at);
        Ok(all_quotes)
    }

    async fn load_margin_settings(&self) -> Result<Option<MarginSettings>> {
        let entries: Vec<MarginSettings> = self.read_jsonl(&self.margins_file()).await?;
        Ok(entries.into_iter().last())
    }

    async fn save_margin_settings(&self, settings: &MarginSettings) -> Result<()> {
        self.append_jsonl(&self.margins_file(), settings).await
    }
}
