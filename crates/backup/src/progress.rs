use tokio::sync::mpsc;
use tracing::warn;

/// Event stream from every pipeline task to the single progress handler.
#[derive(Debug)]
pub enum ProgressEvent {
    FileExamined { bytes: u64 },
    FileInherited,
    FileAdded,
    FileSkipped,
    BlockProcessed { new: bool, bytes: u64 },
    VolumeUploaded { bytes: u64 },
    Warning(String),
}

/// Counters aggregated over one backup run.
#[derive(Debug, Clone, Default)]
pub struct BackupStats {
    pub examined_files: u64,
    pub examined_bytes: u64,
    pub inherited_files: u64,
    pub added_files: u64,
    pub skipped_files: u64,
    pub new_blocks: u64,
    pub duplicate_blocks: u64,
    pub new_bytes: u64,
    pub uploaded_volumes: u64,
    pub uploaded_bytes: u64,
    pub warnings: Vec<String>,
}

impl BackupStats {
    pub fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::FileExamined { bytes } => {
                self.examined_files += 1;
                self.examined_bytes += bytes;
            }
            ProgressEvent::FileInherited => self.inherited_files += 1,
            ProgressEvent::FileAdded => self.added_files += 1,
            ProgressEvent::FileSkipped => self.skipped_files += 1,
            ProgressEvent::BlockProcessed { new, bytes } => {
                if new {
                    self.new_blocks += 1;
                    self.new_bytes += bytes;
                } else {
                    self.duplicate_blocks += 1;
                }
            }
            ProgressEvent::VolumeUploaded { bytes } => {
                self.uploaded_volumes += 1;
                self.uploaded_bytes += bytes;
            }
            ProgressEvent::Warning(message) => {
                warn!(%message, "backup warning");
                self.warnings.push(message);
            }
        }
    }
}

/// Single aggregation task at the end of the pipeline.
pub(crate) async fn progress_handler(mut events: mpsc::Receiver<ProgressEvent>) -> BackupStats {
    let mut stats = BackupStats::default();
    while let Some(event) = events.recv().await {
        stats.apply(event);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_aggregation() {
        let mut stats = BackupStats::default();
        stats.apply(ProgressEvent::FileExamined { bytes: 10 });
        stats.apply(ProgressEvent::BlockProcessed { new: true, bytes: 10 });
        stats.apply(ProgressEvent::BlockProcessed { new: false, bytes: 10 });
        stats.apply(ProgressEvent::Warning("odd".into()));
        assert_eq!(stats.examined_files, 1);
        assert_eq!(stats.new_blocks, 1);
        assert_eq!(stats.duplicate_blocks, 1);
        assert_eq!(stats.new_bytes, 10);
        assert_eq!(stats.warnings.len(), 1);
    }
}
