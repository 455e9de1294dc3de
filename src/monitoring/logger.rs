use anyhow::Result;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;
use crate::data::types::ProbabilitySnapshot;
use crate::engine::Diagnostics;

/// Append-only CSV log of probability updates
pub struct CsvLogger {
    log_path: String,
    // Serializes appends from concurrent market updates
    write_lock: Mutex<()>,
}

impl CsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !std::path::Path::new(&log_path).exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)?;

            writeln!(
                file,
                "timestamp,market_id,accepted_posts,w_batch,beta,temperature,floor,probabilities"
            )?;
        }

        Ok(Self { log_path, write_lock: Mutex::new(()) })
    }

    fn append(&self, line: &str) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| anyhow::anyhow!("csv lock poisoned"))?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    /// Log one applied update
    pub fn log_update(&self, snapshot: &ProbabilitySnapshot, diagnostics: &Diagnostics) -> Result<()> {
        // outcome=probability pairs separated by ';' to stay one CSV column
        let probabilities = snapshot
            .probabilities
            .iter()
            .map(|(id, p)| format!("{}={:.6}", id, p))
            .collect::<Vec<_>>()
            .join(";");

        self.append(&format!(
            "{},{},{},{:.6},{:.6},{:.6},{:.6},{}",
            snapshot.timestamp.to_rfc3339(),
            snapshot.market_id,
            diagnostics.accepted_posts,
            diagnostics.w_batch,
            diagnostics.beta,
            diagnostics.temperature,
            diagnostics.floor,
            probabilities
        ))
    }

    /// Log a worker event
    pub fn log_event(&self, event: &str) -> Result<()> {
        self.append(&format!("{},EVENT,,,,,,{}", Utc::now().to_rfc3339(), event))
    }
}
