use serde_json::{json, Map, Value};
use site_guard::config::SessionSettings;
use site_guard::error::SessionError;
use site_guard::kv_store::{KeyValueStore, MemoryStore};
use site_guard::session::{
    session_key, SessionBinding, SessionManager, SessionOptions, SessionPayload, ValidationContext,
};
use site_guard::session_crypto::{EncryptedData, SessionCipher};
use std::sync::Arc;
use std::time::Duration;

const CHROME_120_109: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.6099.109 Safari/537.36";
const CHROME_120_130: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 Chrome/120.0.6099.130 Safari/537.36";
const FIREFOX: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

fn manager() -> (SessionManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let cipher = SessionCipher::from_secret("integration-secret").unwrap();
    (SessionManager::new(store.clone(), cipher, 86_400), store)
}

fn user(id: &str) -> SessionPayload {
    SessionPayload {
        user_id: Some(id.to_string()),
        ..Default::default()
    }
}

fn bound_options(ip: &str, ua: &str) -> SessionOptions {
    SessionOptions {
        client_ip: Some(ip.to_string()),
        user_agent: Some(ua.to_string()),
        binding: Some(SessionBinding {
            bind_ip: true,
            bind_user_agent: true,
        }),
        ..Default::default()
    }
}

fn context(ip: &str, ua: &str, strict: bool) -> ValidationContext {
    ValidationContext {
        client_ip: Some(ip.to_string()),
        user_agent: Some(ua.to_string()),
        strict_binding: strict,
    }
}

#[tokio::test]
async fn test_tampered_ciphertext_reads_as_missing() {
    let (manager, store) = manager();
    let created = manager.create_session(user("u1"), SessionOptions::default()).await.unwrap();
    let key = session_key(&created.session_token);

    let raw = store.get(&key).await.unwrap().unwrap();
    let mut sealed: EncryptedData = serde_json::from_str(&raw).unwrap();
    let mut bytes = hex::decode(&sealed.encrypted).unwrap();
    bytes[0] ^= 0x80;
    sealed.encrypted = hex::encode(bytes);
    store.overwrite_raw(&key, &serde_json::to_string(&sealed).unwrap());

    assert!(manager.get_session(&created.session_token).await.is_none());
}

#[tokio::test]
async fn test_tampered_tag_reads_as_missing() {
    let (manager, store) = manager();
    let created = manager.create_session(user("u2"), SessionOptions::default()).await.unwrap();
    let key = session_key(&created.session_token);

    let raw = store.get(&key).await.unwrap().unwrap();
    let mut sealed: EncryptedData = serde_json::from_str(&raw).unwrap();
    let mut tag = hex::decode(&sealed.auth_tag).unwrap();
    tag[15] ^= 0x01;
    sealed.auth_tag = hex::encode(tag);
    store.overwrite_raw(&key, &serde_json::to_string(&sealed).unwrap());

    assert!(manager.get_session(&created.session_token).await.is_none());
}

#[tokio::test]
async fn test_strict_binding_rejects_other_ip() {
    let (manager, _) = manager();
    let created = manager
        .create_session(user("u3"), bound_options("203.0.113.1", FIREFOX))
        .await
        .unwrap();

    let other_ip = context("198.51.100.9", FIREFOX, true);
    assert!(manager.validate_session(&created.session_token, &other_ip).await.is_none());

    let same = context("203.0.113.1", FIREFOX, true);
    assert!(manager.validate_session(&created.session_token, &same).await.is_some());
}

#[tokio::test]
async fn test_strict_binding_rejects_other_browser() {
    let (manager, _) = manager();
    let created = manager
        .create_session(user("u4"), bound_options("203.0.113.1", CHROME_120_109))
        .await
        .unwrap();

    let firefox = context("203.0.113.1", FIREFOX, true);
    assert!(manager.validate_session(&created.session_token, &firefox).await.is_none());
}

#[tokio::test]
async fn test_browser_patch_update_keeps_session() {
    let (manager, _) = manager();
    let created = manager
        .create_session(user("u5"), bound_options("203.0.113.1", CHROME_120_109))
        .await
        .unwrap();

    let patched = context("203.0.113.1", CHROME_120_130, true);
    assert!(manager.validate_session(&created.session_token, &patched).await.is_some());
}

#[tokio::test]
async fn test_non_strict_binding_accepts_mismatch() {
    let (manager, _) = manager();
    let created = manager
        .create_session(user("u6"), bound_options("203.0.113.1", CHROME_120_109))
        .await
        .unwrap();

    let moved = context("198.51.100.9", FIREFOX, false);
    let session = manager.validate_session(&created.session_token, &moved).await.unwrap();
    assert_eq!(session.user_id.as_deref(), Some("u6"));
}

#[tokio::test]
async fn test_unbound_session_ignores_request_attributes() {
    let (manager, _) = manager();
    let created = manager.create_session(user("u7"), SessionOptions::default()).await.unwrap();

    let anywhere = context("198.51.100.9", FIREFOX, true);
    assert!(manager.validate_session(&created.session_token, &anywhere).await.is_some());
}

#[tokio::test]
async fn test_cleanup_and_stats() {
    let (manager, store) = manager();
    let live = manager.create_session(user("live"), SessionOptions::default()).await.unwrap();
    let broken = manager.create_session(user("broken"), SessionOptions::default()).await.unwrap();
    store.overwrite_raw(&session_key(&broken.session_token), "garbage");

    let stats = manager.session_stats().await.unwrap();
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.expired_sessions, 1);

    let report = manager.cleanup_expired_sessions().await.unwrap();
    assert_eq!(report.cleaned, 1);

    let stats = manager.session_stats().await.unwrap();
    assert_eq!(stats.total_sessions, 1);
    assert!(manager.get_session(&live.session_token).await.is_some());
}

#[tokio::test]
async fn test_revoke_user_sessions() {
    let (manager, _) = manager();
    let a1 = manager.create_session(user("alice"), SessionOptions::default()).await.unwrap();
    let a2 = manager.create_session(user("alice"), SessionOptions::default()).await.unwrap();
    let b1 = manager.create_session(user("bob"), SessionOptions::default()).await.unwrap();

    let report = manager.revoke_user_sessions("alice").await.unwrap();
    assert_eq!(report.revoked, 2);

    assert!(manager.get_session(&a1.session_token).await.is_none());
    assert!(manager.get_session(&a2.session_token).await.is_none());
    assert!(manager.get_session(&b1.session_token).await.is_some());

    assert_eq!(manager.revoke_user_sessions("nobody").await.unwrap().revoked, 0);
}

#[tokio::test]
async fn test_update_then_csrf_unchanged() {
    let (manager, _) = manager();
    let created = manager.create_session(user("u8"), SessionOptions::default()).await.unwrap();

    let mut updates = Map::new();
    updates.insert("email".to_string(), json!("new@example.com"));
    assert!(manager.update_session(&created.session_token, updates, true).await);

    let session = manager.get_session(&created.session_token).await.unwrap();
    assert_eq!(session.email.as_deref(), Some("new@example.com"));
    assert!(manager.validate_csrf(&created.session_token, &created.csrf_token).await);
}

#[tokio::test]
async fn test_cleanup_task_runs() {
    let store = Arc::new(MemoryStore::new());
    let cipher = SessionCipher::from_secret("task-secret").unwrap();
    let manager = Arc::new(SessionManager::new(store.clone(), cipher, 3600));

    let created = manager.create_session(user("t"), SessionOptions::default()).await.unwrap();
    store.overwrite_raw(&session_key(&created.session_token), "garbage");

    let handle = manager.clone().spawn_cleanup_task(Duration::from_millis(20));
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();

    assert!(store.is_empty());
}

#[tokio::test]
async fn test_missing_key_is_startup_error() {
    let settings = SessionSettings {
        encryption_key_env: "SITE_GUARD_INTEGRATION_UNSET_KEY".to_string(),
        ..Default::default()
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let result = SessionManager::from_settings(store, &settings);
    assert!(matches!(result, Err(SessionError::MissingEncryptionKey(_))));
}

#[tokio::test]
async fn test_session_json_is_camel_case() {
    let (manager, _) = manager();
    let created = manager.create_session(user("u9"), SessionOptions::default()).await.unwrap();
    let session = manager.get_session(&created.session_token).await.unwrap();

    let value: Value = serde_json::to_value(&session).unwrap();
    for field in ["userId", "lastActivity", "csrfToken", "createdAt", "expiresAt"] {
        assert!(value.get(field).is_some(), "missing {}", field);
    }
}
