use std::path::{Path, PathBuf};

use serde::Serialize;
use snafu::ResultExt;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

use crate::{
    error::{DeadLetterFileSnafu, Result, SinkError},
    mutation::{Batch, Mutation},
};

/// Append-only JSON lines file of batches that could not be applied.
pub struct DeadLetterFile {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

#[derive(Serialize)]
struct DeadLetterEntry<'a> {
    field: &'a str,
    kind: &'static str,
    error: String,
    mutations: &'a [Mutation],
}

impl DeadLetterFile {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context(DeadLetterFileSnafu { path: path.clone() })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends a batch. Write failures are logged, the batch is lost.
    pub async fn append(&self, batch: &Batch, error: &SinkError) {
        let entry = DeadLetterEntry {
            field: &batch.field.name,
            kind: batch.field.kind.name(),
            error: error.to_string(),
            mutations: &batch.mutations,
        };

        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, field = %batch.field, "failed to serialize dead letter");
                return;
            }
        };
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if let Err(err) = file.write_all(&line).await {
            warn!(error = %err, path = %self.path.display(), "failed to write dead letter");
            return;
        }
        if let Err(err) = file.flush().await {
            warn!(error = %err, path = %self.path.display(), "failed to flush dead letter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{Bit, FieldKind, FieldTarget, Ref};

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead.jsonl");
        let file = DeadLetterFile::open(&path).await.unwrap();

        let field = FieldTarget::new("age", FieldKind::Int { min: 0, max: 150 });
        let mut batch = Batch::new(field.clone());
        batch.mutations.push(Mutation {
            field,
            bit: Bit::Value(42),
            column: Ref::Id(7),
            timestamp: None,
        });
        let error = SinkError::Rejected {
            message: "unknown field".to_string(),
        };

        file.append(&batch, &error).await;
        file.append(&batch, &error).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);

        let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry["field"], "age");
        assert_eq!(entry["kind"], "int");
        assert_eq!(entry["mutations"].as_array().unwrap().len(), 1);
    }
}
