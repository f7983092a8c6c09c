//! Session file handling.
//!
//! The blob filestore is an external collaborator; the runner consumes the
//! narrow contract here. `FileHandler` is the piece the model instances use:
//! it stages a session's input files into the instance workspace before the
//! session runs, and ships result files back out afterwards.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use fleet_common::{RunnerTaskResponse, Session, SessionMode, LORA_DIR_NONE};

use crate::error::{Result, RunnerError};

/// The blob-store contract the runner consumes.
#[async_trait]
pub trait Filestore: Send + Sync {
    /// Copy a stored object to a local path.
    async fn download(&self, path: &str, dest: &Path) -> Result<()>;
    /// Store a local file under the given path.
    async fn upload(&self, path: &str, src: &Path) -> Result<()>;
    /// Object paths under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Filestore over a local directory tree. Backs tests and single-host
/// deployments where the store is a mounted volume.
pub struct LocalFilestore {
    root: PathBuf,
}

impl LocalFilestore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Filestore for LocalFilestore {
    async fn download(&self, path: &str, dest: &Path) -> Result<()> {
        let src = self.resolve(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RunnerError::Filestore(e.to_string()))?;
        }
        tokio::fs::copy(&src, dest)
            .await
            .map_err(|e| RunnerError::Filestore(format!("download {}: {}", path, e)))?;
        Ok(())
    }

    async fn upload(&self, path: &str, src: &Path) -> Result<()> {
        let dest = self.resolve(path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RunnerError::Filestore(e.to_string()))?;
        }
        tokio::fs::copy(src, &dest)
            .await
            .map_err(|e| RunnerError::Filestore(format!("upload {}: {}", path, e)))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(vec![]),
        };
        let mut paths = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RunnerError::Filestore(e.to_string()))?
        {
            if entry
                .file_type()
                .await
                .map_err(|e| RunnerError::Filestore(e.to_string()))?
                .is_file()
            {
                paths.push(format!(
                    "{}/{}",
                    prefix.trim_end_matches('/'),
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Downloads session inputs into an instance workspace and uploads result
/// files back to the filestore.
pub struct FileHandler {
    store: std::sync::Arc<dyn Filestore>,
    workspace: PathBuf,
}

impl FileHandler {
    pub fn new(store: std::sync::Arc<dyn Filestore>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            store,
            workspace: workspace.into(),
        }
    }

    fn session_dir(&self, instance_id: &str, session_id: &str) -> PathBuf {
        self.workspace.join(instance_id).join(session_id)
    }

    fn file_name(path: &str) -> &str {
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Stage a session's files locally and return the session rewritten to
    /// point at them.
    ///
    /// Inference inputs land under `inputs/`, fine-tune inputs under
    /// `dataset/`. When `fetch_lora` is set and the session carries a
    /// fine-tune artifact, the artifact directory is mirrored under `lora/`
    /// and the session's `lora_dir` is rewritten to the local copy.
    pub async fn download_session(
        &self,
        instance_id: &str,
        session: &Session,
        fetch_lora: bool,
    ) -> Result<Session> {
        let mut prepared = session.clone();
        let dir = self.session_dir(instance_id, &session.id);

        let subdir = match session.mode {
            SessionMode::Inference => "inputs",
            SessionMode::Finetune => "dataset",
        };

        if let Some(interaction) = prepared
            .interactions
            .iter_mut()
            .rev()
            .find(|i| i.creator == fleet_common::CreatorType::User)
        {
            let mut local_files = Vec::with_capacity(interaction.files.len());
            for file in &interaction.files {
                let dest = dir.join(subdir).join(Self::file_name(file));
                self.store.download(file, &dest).await.map_err(|e| {
                    RunnerError::Preparation(format!("session {}: {}", session.id, e))
                })?;
                local_files.push(dest.to_string_lossy().into_owned());
            }
            interaction.files = local_files;
        }

        if fetch_lora && !session.lora_dir.is_empty() && session.lora_dir != LORA_DIR_NONE {
            let lora_dest = dir.join("lora");
            let objects = self.store.list(&session.lora_dir).await?;
            if objects.is_empty() {
                return Err(RunnerError::Preparation(format!(
                    "session {}: empty lora dir {}",
                    session.id, session.lora_dir
                )));
            }
            for object in objects {
                let dest = lora_dest.join(Self::file_name(&object));
                self.store.download(&object, &dest).await.map_err(|e| {
                    RunnerError::Preparation(format!("session {}: {}", session.id, e))
                })?;
            }
            prepared.lora_dir = lora_dest.to_string_lossy().into_owned();
        }

        Ok(prepared)
    }

    /// Upload a result's local output files (and fine-tune artifact, if
    /// any) and rewrite the response to filestore paths.
    pub async fn upload_response(
        &self,
        response: RunnerTaskResponse,
    ) -> Result<RunnerTaskResponse> {
        let mut uploaded = response;
        let session_id = uploaded.session_id.clone();

        let mut remote_files = Vec::with_capacity(uploaded.files.len());
        for file in &uploaded.files {
            let local = PathBuf::from(file);
            let remote = format!("sessions/{}/results/{}", session_id, Self::file_name(file));
            self.store.upload(&remote, &local).await?;
            remote_files.push(remote);
        }
        uploaded.files = remote_files;

        if !uploaded.lora_dir.is_empty() && uploaded.lora_dir != LORA_DIR_NONE {
            let local_dir = PathBuf::from(&uploaded.lora_dir);
            let remote_dir = format!("sessions/{}/lora", session_id);
            let mut entries = tokio::fs::read_dir(&local_dir)
                .await
                .map_err(|e| RunnerError::Filestore(format!("lora dir: {}", e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| RunnerError::Filestore(e.to_string()))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                self.store
                    .upload(&format!("{}/{}", remote_dir, name), &entry.path())
                    .await?;
            }
            uploaded.lora_dir = remote_dir;
        }

        Ok(uploaded)
    }
}
