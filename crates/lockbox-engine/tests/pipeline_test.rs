//! End-to-end encrypt/decrypt tests against the in-memory key store.
//!
//! These exercise the full operation: key + credential, authentication gate,
//! container header, streaming cipher, progress events and catalog writes.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lockbox_core::{AuthError, ErrorKind, FileDescriptor, LockboxError, OperationState};
use lockbox_crypto::{TransferOptions, HEADER_LEN, IV_SIZE};
use lockbox_engine::{
    Catalog, CryptoEvent, CryptoOrchestrator, JsonCatalog, OrchestratorOptions,
};
use lockbox_secrets::{
    AuthGate, Authenticator, Challenge, KdfParams, KeyManager, MemoryKeyStore, SecureKeyStore,
};
use secrecy::SecretString;

const PIN: &str = "1234";

fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

/// Answers every prompt with the same passphrase, counting prompts
struct Fixed {
    answer: Result<&'static str, AuthError>,
    prompts: AtomicUsize,
}

impl Fixed {
    fn new(answer: Result<&'static str, AuthError>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            prompts: AtomicUsize::new(0),
        })
    }
}

impl Authenticator for Fixed {
    fn prompt(&self, _challenge: &Challenge) -> Result<SecretString, AuthError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map(SecretString::from)
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    store: Arc<MemoryKeyStore>,
    auth: Arc<Fixed>,
    catalog: Arc<JsonCatalog>,
    orchestrator: CryptoOrchestrator,
}

impl Harness {
    fn new(answer: Result<&'static str, AuthError>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let store = Arc::new(MemoryKeyStore::new("my_key"));
        store
            .enroll_credential(&SecretString::from(PIN), &fast_params())
            .unwrap();
        let keys = Arc::new(KeyManager::new(store.clone()));
        let auth = Fixed::new(answer);
        let gate = Arc::new(AuthGate::new(auth.clone(), 3));
        let catalog = Arc::new(JsonCatalog::new(root.join("catalog.json")));

        let options = OrchestratorOptions {
            output_dir: root.join("files"),
            encrypted_suffix: ".enc".into(),
            transfer: TransferOptions::default(),
        };
        let orchestrator = CryptoOrchestrator::new(keys, gate, catalog.clone(), options);

        Self {
            _dir: dir,
            root,
            store,
            auth,
            catalog,
            orchestrator,
        }
    }

    fn plaintext(&self, name: &str, data: &[u8]) -> FileDescriptor {
        let path = self.root.join(name);
        std::fs::write(&path, data).unwrap();
        FileDescriptor::from_path(&path).unwrap()
    }

    fn output_files(&self) -> Vec<std::path::PathBuf> {
        let dir = self.root.join("files");
        if !dir.exists() {
            return Vec::new();
        }
        let mut files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        files
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn progress_values(events: &[CryptoEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            CryptoEvent::Progress { bytes, .. } => Some(*bytes),
            _ => None,
        })
        .collect()
}

fn states(events: &[CryptoEvent]) -> Vec<OperationState> {
    events
        .iter()
        .filter_map(|e| match e {
            CryptoEvent::State(s) => Some(*s),
            _ => None,
        })
        .collect()
}

async fn decrypt_to(h: &Harness, encrypted: &FileDescriptor, target: &Path) -> FileDescriptor {
    h.orchestrator
        .decrypt(
            encrypted.clone(),
            target.to_path_buf(),
            encrypted.display_name.clone(),
        )
        .wait()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_encrypt_decrypt_roundtrip() {
    let h = Harness::new(Ok(PIN));
    let data = pattern(100_003);
    let source = h.plaintext("report.pdf", &data);

    let (events, result) = h.orchestrator.encrypt(source.clone()).collect().await;
    let encrypted = result.unwrap();

    assert!(encrypted.is_encrypted);
    assert_eq!(encrypted.size, data.len() as u64);
    assert_eq!(encrypted.display_name, "report.pdf");
    assert_eq!(encrypted.mime_type, "application/pdf");
    assert_eq!(
        encrypted.location,
        h.root.join("files").join("report.pdf.enc")
    );
    assert_eq!(
        states(&events),
        vec![
            OperationState::Start,
            OperationState::AwaitingAuth,
            OperationState::Transferring,
            OperationState::Complete,
        ]
    );
    assert!(matches!(events.last(), Some(CryptoEvent::Complete(fd)) if fd == &encrypted));

    let container = std::fs::read(&encrypted.location).unwrap();
    assert_eq!(container[0], IV_SIZE as u8);
    let body = container.len() - HEADER_LEN;
    assert_eq!(body % 16, 0);
    assert!(body > data.len());

    let target = h.root.join("restored.pdf");
    let decrypted = decrypt_to(&h, &encrypted, &target).await;
    assert!(!decrypted.is_encrypted);
    assert_eq!(decrypted.size, data.len() as u64);
    assert_eq!(std::fs::read(&target).unwrap(), data);

    // one entry per successful operation
    let entries = h.catalog.list_entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, encrypted.id);
    assert_eq!(entries[1].id, decrypted.id);
    assert_eq!(h.auth.prompts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ten_mib_reports_twenty_progress_steps() {
    let h = Harness::new(Ok(PIN));
    let data = pattern(10 * 1024 * 1024);
    let source = h.plaintext("big.bin", &data);

    let (events, result) = h.orchestrator.encrypt(source).collect().await;
    let encrypted = result.unwrap();

    let progress = progress_values(&events);
    assert_eq!(progress.len(), 20);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*progress.last().unwrap(), data.len() as u64);
    assert!(events.iter().all(|e| match e {
        CryptoEvent::Progress { total, .. } => *total == data.len() as u64,
        _ => true,
    }));

    let container = std::fs::read(&encrypted.location).unwrap();
    assert_eq!(container[0], 0x10);

    let target = h.root.join("big.out");
    let (events, result) = h
        .orchestrator
        .decrypt(encrypted.clone(), target.clone(), "big.bin".into())
        .collect()
        .await;
    result.unwrap();
    let progress = progress_values(&events);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|&p| p <= data.len() as u64));
    assert_eq!(std::fs::read(&target).unwrap(), data);
}

#[tokio::test]
async fn test_same_plaintext_gets_distinct_ivs_and_names() {
    let h = Harness::new(Ok(PIN));
    let source = h.plaintext("notes.txt", b"identical contents, identical key");

    let mut artifacts = Vec::new();
    for _ in 0..4 {
        artifacts.push(
            h.orchestrator
                .encrypt(source.clone())
                .wait()
                .await
                .unwrap(),
        );
    }

    let names: Vec<_> = artifacts
        .iter()
        .map(|a| a.location.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(
        names,
        vec!["notes.txt.enc", "notes.txt_2.enc", "notes.txt_3.enc", "notes.txt_4.enc"]
    );
    assert_eq!(h.output_files().len(), 4);

    let a = std::fs::read(&artifacts[0].location).unwrap();
    let b = std::fs::read(&artifacts[1].location).unwrap();
    assert_ne!(a[1..HEADER_LEN], b[1..HEADER_LEN], "IVs must differ");
    assert_ne!(a[HEADER_LEN..], b[HEADER_LEN..], "ciphertexts must differ");

    // every artifact decrypts back to the same plaintext
    for (i, artifact) in artifacts.iter().enumerate() {
        let target = h.root.join(format!("out{i}.txt"));
        decrypt_to(&h, artifact, &target).await;
        assert_eq!(
            std::fs::read(&target).unwrap(),
            b"identical contents, identical key"
        );
    }
}

#[tokio::test]
async fn test_existing_artifact_is_never_overwritten() {
    let h = Harness::new(Ok(PIN));
    std::fs::create_dir_all(h.root.join("files")).unwrap();
    std::fs::write(h.root.join("files/photo.jpg.enc"), b"someone else's file").unwrap();

    let source = h.plaintext("photo.jpg", &pattern(5000));
    let encrypted = h.orchestrator.encrypt(source).wait().await.unwrap();

    assert_eq!(
        encrypted.location.file_name().unwrap(),
        "photo.jpg_2.enc"
    );
    assert_eq!(
        std::fs::read(h.root.join("files/photo.jpg.enc")).unwrap(),
        b"someone else's file"
    );
}

#[tokio::test]
async fn test_tampered_iv_length_fails_without_catalog_write() {
    let h = Harness::new(Ok(PIN));
    let source = h.plaintext("a.txt", b"some secret text");
    let encrypted = h.orchestrator.encrypt(source).wait().await.unwrap();
    let entries_before = h.catalog.list_entries().unwrap().len();
    let prompts_before = h.auth.prompts.load(Ordering::SeqCst);

    let mut container = std::fs::read(&encrypted.location).unwrap();
    container[0] = 0x20;
    std::fs::write(&encrypted.location, &container).unwrap();

    let target = h.root.join("a.out");
    let (events, result) = h
        .orchestrator
        .decrypt(encrypted, target.clone(), "a.txt".into())
        .collect()
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codec);
    assert!(matches!(
        err,
        LockboxError::Codec(lockbox_core::CodecError::UnexpectedLength {
            expected: 16,
            found: 32
        })
    ));
    assert!(matches!(
        events.last(),
        Some(CryptoEvent::Failed {
            kind: ErrorKind::Codec,
            ..
        })
    ));
    assert_eq!(h.catalog.list_entries().unwrap().len(), entries_before);
    assert_eq!(h.auth.prompts.load(Ordering::SeqCst), prompts_before);
    assert!(!target.exists());
}

#[tokio::test]
async fn test_auth_cancel_writes_nothing() {
    let h = Harness::new(Err(AuthError::Cancelled));
    let source = h.plaintext("secret.txt", b"do not leak");

    let (events, result) = h.orchestrator.encrypt(source).collect().await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthCancelled);
    assert_eq!(
        states(&events),
        vec![
            OperationState::Start,
            OperationState::AwaitingAuth,
            OperationState::Failed,
        ]
    );
    assert!(progress_values(&events).is_empty());
    assert!(h.output_files().is_empty(), "placeholder must be removed");
    assert!(h.catalog.list_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_handle_cancel_before_prompt() {
    let h = Harness::new(Ok(PIN));
    let source = h.plaintext("secret.txt", b"do not leak");

    let handle = h.orchestrator.encrypt(source);
    handle.cancel();
    let err = handle.wait().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthCancelled);
    assert!(h.output_files().is_empty());
    assert!(h.catalog.list_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_lockout_after_wrong_passphrases() {
    let h = Harness::new(Ok("0000"));
    let source = h.plaintext("a.txt", b"data");

    let err = h.orchestrator.encrypt(source).wait().await.unwrap_err();
    assert!(matches!(
        err,
        LockboxError::Auth(AuthError::Lockout { attempts: 3 })
    ));
    assert_eq!(h.auth.prompts.load(Ordering::SeqCst), 3);
    assert!(h.output_files().is_empty());
}

#[tokio::test]
async fn test_credential_change_invalidates_key() {
    let h = Harness::new(Ok(PIN));
    let source = h.plaintext("a.txt", b"data");
    let encrypted = h.orchestrator.encrypt(source.clone()).wait().await.unwrap();

    h.store
        .enroll_credential(&SecretString::from(PIN), &fast_params())
        .unwrap();

    let err = h.orchestrator.encrypt(source).wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyInvalidated);

    let err = h
        .orchestrator
        .decrypt(encrypted, h.root.join("a.out"), "a.txt".into())
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyInvalidated);
    assert_eq!(h.catalog.list_entries().unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_file_is_indeterminate() {
    let h = Harness::new(Ok(PIN));
    let source = h.plaintext("empty.txt", b"");

    let (events, result) = h.orchestrator.encrypt(source).collect().await;
    let encrypted = result.unwrap();

    assert!(events.contains(&CryptoEvent::Indeterminate));
    assert!(progress_values(&events).is_empty());
    // header plus one full padding block
    assert_eq!(
        std::fs::metadata(&encrypted.location).unwrap().len(),
        (HEADER_LEN + 16) as u64
    );

    let target = h.root.join("empty.out");
    decrypt_to(&h, &encrypted, &target).await;
    assert!(std::fs::read(&target).unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_source_fails_with_io() {
    let h = Harness::new(Ok(PIN));
    let mut source = h.plaintext("gone.txt", b"x");
    std::fs::remove_file(&source.location).unwrap();
    source.size = 1;

    let err = h.orchestrator.encrypt(source).wait().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(h.auth.prompts.load(Ordering::SeqCst), 0);
    assert!(h.output_files().is_empty());
}

#[tokio::test]
async fn test_decrypt_onto_own_container_is_refused() {
    let h = Harness::new(Ok(PIN));
    let data = pattern(40_000);
    let source = h.plaintext("ledger.csv", &data);
    let encrypted = h.orchestrator.encrypt(source).wait().await.unwrap();
    let container = std::fs::read(&encrypted.location).unwrap();
    let prompts_before = h.auth.prompts.load(Ordering::SeqCst);

    // same file through a different spelling of the path
    let alias = h.root.join("files").join(".").join("ledger.csv.enc");
    let err = h
        .orchestrator
        .decrypt(encrypted.clone(), alias, "ledger.csv".into())
        .wait()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(h.auth.prompts.load(Ordering::SeqCst), prompts_before);
    assert_eq!(std::fs::read(&encrypted.location).unwrap(), container);
    assert_eq!(h.catalog.list_entries().unwrap().len(), 1);

    // the container is still intact
    let target = h.root.join("ledger.out");
    decrypt_to(&h, &encrypted, &target).await;
    assert_eq!(std::fs::read(&target).unwrap(), data);
}
