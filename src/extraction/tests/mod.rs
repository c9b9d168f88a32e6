use crate::error::{Error, ExtractionError, Result};
use crate::extraction::*;
use crate::types::ArchiveFormat;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Archive tool that fabricates output instead of running 7-Zip
#[derive(Default)]
struct FakeTool {
    unwraps: AtomicUsize,
    extracts: AtomicUsize,
    /// Entries written by `extract_all`, as (relative path, content)
    tree: Vec<(&'static str, &'static str)>,
    /// Make `unwrap_payload` fail
    fail_unwrap: bool,
    /// Make `unwrap_payload` report a path it never created
    lose_payload: bool,
    /// Delay inside `unwrap_payload` to widen race windows
    unwrap_delay: Option<Duration>,
}

impl FakeTool {
    fn with_tree(tree: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            tree,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ArchiveTool for FakeTool {
    async fn unwrap_payload(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        self.unwraps.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.unwrap_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_unwrap {
            return Err(ExtractionError::ExtractionFailed {
                archive: archive.to_path_buf(),
                reason: "corrupt container".to_string(),
            }
            .into());
        }
        let inner = out_dir.join("inner.bin");
        if self.lose_payload {
            return Ok(inner);
        }
        tokio::fs::write(&inner, format!("{format:?} payload")).await?;
        Ok(inner)
    }

    async fn extract_all(&self, _archive: &Path, out_dir: &Path) -> Result<()> {
        self.extracts.fetch_add(1, Ordering::SeqCst);
        for (rel, content) in &self.tree {
            let path = out_dir.join(rel);
            tokio::fs::create_dir_all(path.parent().unwrap()).await?;
            tokio::fs::write(&path, content).await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

fn touch(path: &Path) {
    std::fs::write(path, b"outer archive").unwrap();
}

fn sample_tree() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Editor/Data/Managed/UnityEngine.dll", "engine"),
        ("Editor/Data/Managed/UnityEditor.dll", "editor"),
        ("Editor/Data/Managed/nested/Extra.dll", "extra"),
        ("Editor/Data/Resources/icon.png", "icon"),
        ("Editor/libunity.so", "lib"),
    ]
}

// ---------------------------------------------------------------------------
// Format detection
// ---------------------------------------------------------------------------

#[test]
fn test_detect_archive_format_by_extension() {
    let cases = [
        ("Unity-2022.3.1f1.pkg", Some(ArchiveFormat::Installer)),
        ("UnitySetup64.EXE", Some(ArchiveFormat::SelfExtracting)),
        ("Unity.tar.xz", Some(ArchiveFormat::CompressedTar)),
        ("Unity.tar.gz", Some(ArchiveFormat::CompressedTar)),
        ("Unity.tgz", Some(ArchiveFormat::CompressedTar)),
        ("Unity.tar.bz2", Some(ArchiveFormat::CompressedTar)),
        ("Unity.dmg", None),
        ("Unity.zip", None),
        ("Unity.tar", None),
        ("README", None),
    ];
    for (name, expected) in cases {
        assert_eq!(
            detect_archive_format(Path::new(name)),
            expected,
            "format for {name}"
        );
    }
}

#[test]
fn test_payload_path_sits_next_to_archive() {
    assert_eq!(
        payload_path(Path::new("/dl/Unity.pkg")),
        PathBuf::from("/dl/Unity.pkg.payload")
    );
}

// ---------------------------------------------------------------------------
// First stage
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unrecognized_format_fails_without_running_tool() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.dmg");
    touch(&archive);

    let tool = Arc::new(FakeTool::default());
    let extractor = StagedExtractor::new(tool.clone());

    let err = extractor.extract_first_stage(&archive).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Extraction(ExtractionError::UnrecognizedFormat { .. })
    ));
    assert_eq!(tool.unwraps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_first_stage_unwraps_once_and_caches_on_disk() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.pkg");
    touch(&archive);

    let tool = Arc::new(FakeTool::default());
    let extractor = StagedExtractor::new(tool.clone());

    let first = extractor.extract_first_stage(&archive).await.unwrap();
    let second = extractor.extract_first_stage(&archive).await.unwrap();

    assert_eq!(first, payload_path(&archive));
    assert_eq!(first, second);
    assert_eq!(std::fs::read_to_string(&first).unwrap(), "Installer payload");
    assert_eq!(tool.unwraps.load(Ordering::SeqCst), 1);
    assert!(
        !temp.path().join("Unity.pkg.payload.partial").exists(),
        "partial directory should be cleaned up"
    );
}

#[tokio::test]
async fn test_concurrent_first_stage_requests_unwrap_once() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.tar.xz");
    touch(&archive);

    let tool = Arc::new(FakeTool {
        unwrap_delay: Some(Duration::from_millis(100)),
        ..Default::default()
    });
    let extractor = Arc::new(StagedExtractor::new(tool.clone()));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let extractor = Arc::clone(&extractor);
        let archive = archive.clone();
        handles.push(tokio::spawn(async move {
            extractor.extract_first_stage(&archive).await
        }));
    }
    for handle in handles {
        let payload = handle.await.unwrap().unwrap();
        assert_eq!(payload, payload_path(&archive));
    }

    assert_eq!(tool.unwraps.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_payload_from_previous_run_is_reused() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.pkg");
    touch(&archive);
    std::fs::write(payload_path(&archive), b"cached").unwrap();

    let tool = Arc::new(FakeTool::default());
    let extractor = StagedExtractor::new(tool.clone());

    let payload = extractor.extract_first_stage(&archive).await.unwrap();
    assert_eq!(std::fs::read(&payload).unwrap(), b"cached");
    assert_eq!(tool.unwraps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stale_partial_directory_is_replaced() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.pkg");
    touch(&archive);
    let stale = temp.path().join("Unity.pkg.payload.partial");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("half-written"), b"junk").unwrap();

    let extractor = StagedExtractor::new(Arc::new(FakeTool::default()));
    let payload = extractor.extract_first_stage(&archive).await.unwrap();

    assert!(payload.is_file());
    assert!(!stale.exists());
}

#[tokio::test]
async fn test_self_extracting_is_read_directly() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("UnitySetup64.exe");
    touch(&archive);

    let tool = Arc::new(FakeTool::default());
    let extractor = StagedExtractor::new(tool.clone());

    let payload = extractor.extract_first_stage(&archive).await.unwrap();
    assert_eq!(payload, archive);
    assert_eq!(tool.unwraps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_declared_format_overrides_file_name() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("download.bin");
    touch(&archive);

    let extractor = StagedExtractor::new(Arc::new(FakeTool::default()));
    assert!(extractor.extract_first_stage(&archive).await.is_err());

    let payload = extractor
        .extract_first_stage_as(&archive, ArchiveFormat::CompressedTar)
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(payload).unwrap(), "CompressedTar payload");
}

#[tokio::test]
async fn test_failed_unwrap_leaves_no_cache() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.pkg");
    touch(&archive);

    let extractor = StagedExtractor::new(Arc::new(FakeTool {
        fail_unwrap: true,
        ..Default::default()
    }));

    let err = extractor.extract_first_stage(&archive).await.unwrap_err();
    assert!(err.to_string().contains("corrupt container"));
    assert!(!payload_path(&archive).exists());
    assert!(!temp.path().join("Unity.pkg.payload.partial").exists());
}

#[tokio::test]
async fn test_missing_inner_payload_is_reported() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.tgz");
    touch(&archive);

    let extractor = StagedExtractor::new(Arc::new(FakeTool {
        lose_payload: true,
        ..Default::default()
    }));

    let err = extractor.extract_first_stage(&archive).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Extraction(ExtractionError::MissingPayload { .. })
    ));
    assert!(!payload_path(&archive).exists());
}

// ---------------------------------------------------------------------------
// Filtered extraction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_filtered_extraction_keeps_structure() {
    let temp = TempDir::new().unwrap();
    let payload = temp.path().join("payload");
    touch(&payload);
    let dest = temp.path().join("out");

    let extractor = StagedExtractor::new(Arc::new(FakeTool::with_tree(sample_tree())));
    let written = extractor
        .extract_filtered(&payload, &dest, &["Editor/Data/Managed/*.dll"], false)
        .await
        .unwrap();

    assert_eq!(
        written,
        vec![
            dest.join("Editor/Data/Managed/UnityEditor.dll"),
            dest.join("Editor/Data/Managed/UnityEngine.dll"),
        ]
    );
    assert_eq!(
        std::fs::read_to_string(dest.join("Editor/Data/Managed/UnityEngine.dll")).unwrap(),
        "engine"
    );
    assert!(!dest.join("Editor/Data/Managed/nested/Extra.dll").exists());
    assert!(!dest.join("Editor/libunity.so").exists());
}

#[tokio::test]
async fn test_filtered_extraction_flattens() {
    let temp = TempDir::new().unwrap();
    let payload = temp.path().join("payload");
    touch(&payload);
    let dest = temp.path().join("out");

    let extractor = StagedExtractor::new(Arc::new(FakeTool::with_tree(sample_tree())));
    let written = extractor
        .extract_filtered(&payload, &dest, &["**/*.dll", "**/*.so"], true)
        .await
        .unwrap();

    assert_eq!(written.len(), 4);
    for name in ["UnityEngine.dll", "UnityEditor.dll", "Extra.dll", "libunity.so"] {
        assert!(dest.join(name).is_file(), "{name} should be flattened into dest");
    }
    assert!(!dest.join("Editor").exists());
}

#[tokio::test]
async fn test_flatten_collision_keeps_last_match() {
    let temp = TempDir::new().unwrap();
    let payload = temp.path().join("payload");
    touch(&payload);
    let dest = temp.path().join("out");

    let extractor = StagedExtractor::new(Arc::new(FakeTool::with_tree(vec![
        ("a/config.json", "first"),
        ("b/config.json", "second"),
    ])));
    let written = extractor
        .extract_filtered(&payload, &dest, &["**/config.json"], true)
        .await
        .unwrap();

    assert_eq!(written, vec![dest.join("config.json")]);
    assert_eq!(
        std::fs::read_to_string(dest.join("config.json")).unwrap(),
        "second"
    );
}

#[tokio::test]
async fn test_filtered_extraction_removes_staging() {
    let temp = TempDir::new().unwrap();
    let payload = temp.path().join("payload");
    touch(&payload);
    let dest = temp.path().join("out");

    let extractor = StagedExtractor::new(Arc::new(FakeTool::with_tree(sample_tree())));
    extractor
        .extract_filtered(&payload, &dest, &["Editor/libunity.so"], false)
        .await
        .unwrap();

    let leftovers: Vec<_> = std::fs::read_dir(&dest)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["Editor".to_string()]);
}

#[tokio::test]
async fn test_no_matches_is_not_an_error() {
    let temp = TempDir::new().unwrap();
    let payload = temp.path().join("payload");
    touch(&payload);
    let dest = temp.path().join("out");

    let extractor = StagedExtractor::new(Arc::new(FakeTool::with_tree(sample_tree())));
    let written = extractor
        .extract_filtered(&payload, &dest, &["*.txt"], false)
        .await
        .unwrap();
    assert!(written.is_empty());
}

#[tokio::test]
async fn test_invalid_pattern_fails_before_extracting() {
    let temp = TempDir::new().unwrap();
    let payload = temp.path().join("payload");
    touch(&payload);

    let tool = Arc::new(FakeTool::with_tree(sample_tree()));
    let extractor = StagedExtractor::new(tool.clone());
    let err = extractor
        .extract_filtered(&payload, &temp.path().join("out"), &["[oops"], false)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Extraction(ExtractionError::InvalidPattern { .. })
    ));
    assert_eq!(tool.extracts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unavailable_tool_surfaces_not_supported() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("Unity.pkg");
    touch(&archive);

    let extractor = StagedExtractor::new(Arc::new(UnavailableArchiveTool));
    let err = extractor.extract_first_stage(&archive).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
}

#[tokio::test]
async fn test_asset_first_stage_uses_declared_format() {
    use crate::types::{Asset, AssetIndex, AssetSpec};

    let temp = TempDir::new().unwrap();
    let destination = temp.path().join("editor-download");
    touch(&destination);

    let tool = Arc::new(FakeTool::default());
    let extractor = StagedExtractor::new(tool.clone());
    let spec = AssetSpec::new(
        url::Url::parse("https://cdn.example.com/editor").unwrap(),
        "editor-download",
    );

    let undeclared = Asset {
        index: AssetIndex(0),
        destination: destination.clone(),
        spec: spec.clone(),
    };
    assert!(matches!(
        extractor.extract_asset_first_stage(&undeclared).await,
        Err(Error::Extraction(ExtractionError::UnrecognizedFormat { .. }))
    ));

    let declared = Asset {
        spec: spec.with_format(ArchiveFormat::Installer),
        ..undeclared
    };
    let payload = extractor.extract_asset_first_stage(&declared).await.unwrap();
    assert_eq!(payload, payload_path(&destination));
    assert_eq!(tool.unwraps.load(Ordering::SeqCst), 1);
}
