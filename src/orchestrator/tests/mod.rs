
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

use self::fakes::{FakeEmbedder, FakeExtractor, FakeFetcher, FakeTranscriber, FetchMode, TranscribeMode};
use super::*;
use crate::task::ErrorKind;

struct Harness {
    orchestrator: Orchestrator,
    fetcher: Arc<FakeFetcher>,
    extractor: Arc<FakeExtractor>,
    work_root: TempDir,
}

fn harness(fetch: FetchMode, transcribe: TranscribeMode, workers: usize) -> Harness {
    let work_root = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        work_dir: work_root.path().to_path_buf(),
        max_concurrent_tasks: workers,
        min_cue_duration_ms: 1000,
        ..PipelineConfig::default()
    };
    let fetcher = Arc::new(FakeFetcher::new(fetch));
    let extractor = Arc::new(FakeExtractor::default());
    let collaborators = Collaborators {
        fetcher: fetcher.clone(),
        extractor: extractor.clone(),
        transcriber: Arc::new(FakeTranscriber::new(transcribe)),
        embedder: Arc::new(FakeEmbedder),
    };
    let orchestrator = Orchestrator::with_collaborators(
        config,
        TaskRegistry::new(),
        collaborators,
        Metrics::disabled(),
    );
    Harness {
        orchestrator,
        fetcher,
        extractor,
        work_root,
    }
}

fn remote(audio_only: bool) -> InputDescriptor {
    InputDescriptor::RemoteReference {
        url: "https://video.example.com/watch?v=42".to_string(),
        desired_resolution: 720,
        audio_only,
    }
}

fn with_embed(embed_subtitles: bool) -> TaskOptions {
    TaskOptions {
        embed_subtitles,
        ..TaskOptions::default()
    }
}

/// Reserve a task directory and drop an upload into it
async fn submit_upload(h: &Harness, options: TaskOptions) -> (String, PathBuf) {
    let paths = h.orchestrator.reserve_task().unwrap();
    let upload = paths.folder.join("input.mp4");
    fs::write(&upload, b"uploaded video").unwrap();
    let id = h
        .orchestrator
        .submit(paths, InputDescriptor::UploadedFile { path: upload.clone() }, options)
        .await
        .unwrap();
    (id, upload)
}

async fn wait_for<F>(orchestrator: &Orchestrator, id: &str, done: F) -> TaskStatus
where
    F: Fn(&TaskStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = orchestrator.get_status(id).await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not reach the expected state in time")
}

async fn wait_terminal(orchestrator: &Orchestrator, id: &str) -> TaskStatus {
    wait_for(orchestrator, id, |s| s.stage.is_terminal()).await
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

async fn work_dir(h: &Harness, id: &str) -> PathBuf {
    h.orchestrator.registry().get(id).await.unwrap().work_dir
}

#[tokio::test]
async fn test_local_file_task_never_fetches() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Segments, 2);
    let (id, upload) = submit_upload(&h, with_embed(false)).await;

    let status = wait_terminal(&h.orchestrator, &id).await;
    assert_eq!(status.stage, Stage::Completed);

    let task = h.orchestrator.registry().get(&id).await.unwrap();
    assert!(!task.passed_through(Stage::FetchingSource));
    assert!(task.passed_through(Stage::Transcribing));
    assert!(!task.passed_through(Stage::EmbeddingSubtitles));
    assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(*h.extractor.seen.lock().await, vec![upload]);

    // waveform discarded, upload and subtitles kept
    assert_eq!(dir_names(&task.work_dir), vec!["input.mp4", "subtitles.srt"]);
}

#[tokio::test]
async fn test_remote_task_fetches_before_extracting() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Segments, 2);
    let id = h
        .orchestrator
        .create_task(remote(false), with_embed(false))
        .await
        .unwrap();

    let status = wait_terminal(&h.orchestrator, &id).await;
    assert_eq!(status.stage, Stage::Completed);

    let task = h.orchestrator.registry().get(&id).await.unwrap();
    let stages: Vec<Stage> = task.history.iter().map(|t| t.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::Queued,
            Stage::FetchingSource,
            Stage::ExtractingAudio,
            Stage::Transcribing,
            Stage::AssemblingSubtitles,
            Stage::Completed,
        ]
    );
    assert_eq!(*h.extractor.seen.lock().await, vec![task.work_dir.join("source.mp4")]);
    // the fetched source is an intermediate
    assert_eq!(dir_names(&task.work_dir), vec!["subtitles.srt"]);
}

#[tokio::test]
async fn test_completed_subtitles_are_assembled() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Segments, 1);
    let (id, _) = submit_upload(&h, with_embed(false)).await;
    wait_terminal(&h.orchestrator, &id).await;

    let path = h
        .orchestrator
        .get_artifact(&id, ArtifactKind::Subtitle)
        .await
        .unwrap();
    let srt = fs::read_to_string(path).unwrap();
    assert_eq!(
        srt,
        "1\n00:00:00,000 --> 00:00:01,000\na\n\n\
         2\n00:00:01,000 --> 00:00:03,000\nb\n\n\
         3\n00:00:05,000 --> 00:00:06,000\nc\n\n"
    );
}

#[tokio::test]
async fn test_transcription_failure_keeps_only_uploaded_source() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Fail, 1);
    let (id, _) = submit_upload(&h, with_embed(true)).await;

    let status = wait_terminal(&h.orchestrator, &id).await;
    assert_eq!(status.stage, Stage::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::TranscriptionFailed);

    let task = h.orchestrator.registry().get(&id).await.unwrap();
    assert!(task.artifacts.is_none());
    assert!(task.passed_through(Stage::Transcribing));
    assert_eq!(dir_names(&task.work_dir), vec!["input.mp4"]);
}

#[tokio::test]
async fn test_transcription_failure_removes_fetched_source() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Fail, 1);
    let id = h
        .orchestrator
        .create_task(remote(false), with_embed(false))
        .await
        .unwrap();

    let status = wait_terminal(&h.orchestrator, &id).await;
    assert_eq!(status.error.unwrap().kind, ErrorKind::TranscriptionFailed);
    assert!(dir_names(&work_dir(&h, &id).await).is_empty());
}

#[tokio::test]
async fn test_fetch_failure_is_recorded() {
    let h = harness(FetchMode::Unavailable, TranscribeMode::Segments, 1);
    let id = h
        .orchestrator
        .create_task(remote(false), with_embed(false))
        .await
        .unwrap();

    let status = wait_terminal(&h.orchestrator, &id).await;
    assert_eq!(status.stage, Stage::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::SourceUnavailable);
    assert!(h.extractor.seen.lock().await.is_empty());
}

#[tokio::test]
async fn test_cancel_mid_fetch_removes_partial_download() {
    let h = harness(FetchMode::HangAfterPartial, TranscribeMode::Segments, 1);
    let id = h
        .orchestrator
        .create_task(remote(false), with_embed(false))
        .await
        .unwrap();
    let dir = work_dir(&h, &id).await;

    wait_for(&h.orchestrator, &id, |s| s.stage == Stage::FetchingSource).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !dir.join("source.part1").exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.orchestrator.cancel_task(&id).await.unwrap();
    let status = wait_terminal(&h.orchestrator, &id).await;

    assert_eq!(status.stage, Stage::Failed);
    assert_eq!(status.error.unwrap().kind, ErrorKind::Cancelled);
    assert!(dir_names(&dir).is_empty());
    assert!(h.extractor.seen.lock().await.is_empty());
}

#[tokio::test]
async fn test_embedding_produces_video_artifact() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Segments, 1);
    let (id, _) = submit_upload(&h, with_embed(true)).await;

    let status = wait_terminal(&h.orchestrator, &id).await;
    assert_eq!(status.stage, Stage::Completed);

    let video = h.orchestrator.get_artifact(&id, ArtifactKind::Video).await.unwrap();
    assert_eq!(video.file_name().unwrap(), "input_with_subtitles.mp4");
    assert!(video.exists());
    assert_eq!(
        dir_names(&work_dir(&h, &id).await),
        vec!["input.mp4", "input_with_subtitles.mp4", "subtitles.srt"]
    );
}

#[tokio::test]
async fn test_artifact_lookup_errors() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(FetchMode::Succeed, TranscribeMode::Gated(gate.clone()), 1);
    let (id, _) = submit_upload(&h, with_embed(false)).await;

    wait_for(&h.orchestrator, &id, |s| s.stage == Stage::Transcribing).await;
    assert_eq!(
        h.orchestrator.get_artifact(&id, ArtifactKind::Subtitle).await.unwrap_err(),
        TaskLookupError::NotReady(id.clone())
    );

    gate.add_permits(1);
    wait_terminal(&h.orchestrator, &id).await;
    assert_eq!(
        h.orchestrator.get_artifact(&id, ArtifactKind::Video).await.unwrap_err(),
        TaskLookupError::NoSuchArtifact(id.clone(), ArtifactKind::Video)
    );
    assert_eq!(
        h.orchestrator.get_artifact("nope", ArtifactKind::Subtitle).await.unwrap_err(),
        TaskLookupError::TaskNotFound("nope".to_string())
    );
}

#[tokio::test]
async fn test_worker_pool_bounds_running_tasks() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(FetchMode::Succeed, TranscribeMode::Gated(gate.clone()), 1);
    let (first, _) = submit_upload(&h, with_embed(false)).await;
    let (second, _) = submit_upload(&h, with_embed(false)).await;

    wait_for(&h.orchestrator, &first, |s| s.stage == Stage::Transcribing).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.orchestrator.get_status(&second).await.unwrap().stage, Stage::Queued);

    gate.add_permits(2);
    assert_eq!(wait_terminal(&h.orchestrator, &first).await.stage, Stage::Completed);
    assert_eq!(wait_terminal(&h.orchestrator, &second).await.stage, Stage::Completed);
}

#[tokio::test]
async fn test_cancel_queued_task() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(FetchMode::Succeed, TranscribeMode::Gated(gate.clone()), 1);
    let (first, _) = submit_upload(&h, with_embed(false)).await;
    let (second, upload) = submit_upload(&h, with_embed(false)).await;

    wait_for(&h.orchestrator, &first, |s| s.stage == Stage::Transcribing).await;
    h.orchestrator.cancel_task(&second).await.unwrap();

    let status = wait_terminal(&h.orchestrator, &second).await;
    assert_eq!(status.error.unwrap().kind, ErrorKind::Cancelled);
    let task = h.orchestrator.registry().get(&second).await.unwrap();
    let stages: Vec<Stage> = task.history.iter().map(|t| t.stage).collect();
    assert_eq!(stages, vec![Stage::Queued, Stage::Failed]);
    assert!(upload.exists());

    assert_eq!(
        h.orchestrator.cancel_task(&second).await.unwrap_err(),
        TaskLookupError::AlreadyTerminal(second.clone())
    );

    gate.add_permits(1);
    assert_eq!(wait_terminal(&h.orchestrator, &first).await.stage, Stage::Completed);
}

#[tokio::test]
async fn test_reaping_finished_tasks() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(FetchMode::Succeed, TranscribeMode::Gated(gate.clone()), 2);
    let (done, _) = submit_upload(&h, with_embed(false)).await;
    gate.add_permits(1);
    wait_terminal(&h.orchestrator, &done).await;

    let (running, _) = submit_upload(&h, with_embed(false)).await;
    wait_for(&h.orchestrator, &running, |s| s.stage == Stage::Transcribing).await;
    assert_eq!(
        h.orchestrator.reap_task(&running).await.unwrap_err(),
        TaskLookupError::StillRunning(running.clone())
    );

    let done_dir = work_dir(&h, &done).await;
    assert_eq!(h.orchestrator.reap_expired(Duration::ZERO).await, 1);
    assert!(!done_dir.exists());
    assert_eq!(
        h.orchestrator.get_status(&done).await.unwrap_err(),
        TaskLookupError::TaskNotFound(done.clone())
    );
    assert_eq!(h.orchestrator.list_tasks().await.len(), 1);

    gate.add_permits(1);
    wait_terminal(&h.orchestrator, &running).await;
    h.orchestrator.reap_task(&running).await.unwrap();
    assert!(dir_names(h.work_root.path()).is_empty());
}

#[tokio::test]
async fn test_rejected_requests_leave_nothing_behind() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Segments, 1);

    let err = h
        .orchestrator
        .create_task(remote(true), with_embed(true))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskRequestError::InvalidOptions(_)));

    let err = h
        .orchestrator
        .create_task(
            InputDescriptor::RemoteReference {
                url: "ftp://example.com/video.mp4".to_string(),
                desired_resolution: 720,
                audio_only: false,
            },
            with_embed(false),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TaskRequestError::UnsupportedSource(_)));

    let paths = h.orchestrator.reserve_task().unwrap();
    let missing = paths.folder.join("never-written.mp4");
    let err = h
        .orchestrator
        .submit(paths, InputDescriptor::UploadedFile { path: missing }, with_embed(false))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskRequestError::InvalidOptions(_)));

    assert!(dir_names(h.work_root.path()).is_empty());
    assert!(h.orchestrator.list_tasks().await.is_empty());
}

#[tokio::test]
async fn test_embedding_into_audio_upload_is_rejected() {
    let h = harness(FetchMode::Succeed, TranscribeMode::Segments, 1);

    for name in ["talk.mp3", "talk.WAV", "talk.m4a"] {
        let paths = h.orchestrator.reserve_task().unwrap();
        let upload = paths.folder.join(name);
        fs::write(&upload, b"audio").unwrap();
        let err = h
            .orchestrator
            .submit(paths, InputDescriptor::UploadedFile { path: upload }, with_embed(true))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskRequestError::InvalidOptions(_)), "{}", name);
    }
    assert!(dir_names(h.work_root.path()).is_empty());
    assert!(h.extractor.seen.lock().await.is_empty());

    // Subtitles alone are fine for audio
    let paths = h.orchestrator.reserve_task().unwrap();
    let upload = paths.folder.join("talk.mp3");
    fs::write(&upload, b"audio").unwrap();
    let id = h
        .orchestrator
        .submit(paths, InputDescriptor::UploadedFile { path: upload }, with_embed(false))
        .await
        .unwrap();
    assert_eq!(wait_terminal(&h.orchestrator, &id).await.stage, Stage::Completed);
}

#[tokio::test]
async fn test_reaper_refuses_zero_interval() {
    let work_root = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        work_dir: work_root.path().to_path_buf(),
        cleanup_interval: Duration::ZERO,
        ..PipelineConfig::default()
    };
    let orchestrator = Orchestrator::new(config, TaskRegistry::new(), Vec::new(), Metrics::disabled());
    assert!(!orchestrator.start_reaper());

    let config = PipelineConfig {
        work_dir: work_root.path().to_path_buf(),
        cleanup_interval: Duration::from_secs(3600),
        ..PipelineConfig::default()
    };
    let orchestrator = Orchestrator::new(config, TaskRegistry::new(), Vec::new(), Metrics::disabled());
    assert!(orchestrator.start_reaper());
}
