//! Couchbase lifecycle against an in-memory user store

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use dbsecrets_couchbase::prelude::*;
use dbsecrets_plugin::prelude::*;

#[derive(Default)]
struct Cluster {
    users: Mutex<HashMap<String, LocalUser>>,
    admin_passwords: Mutex<Vec<String>>,
    own_password_changes: Mutex<Vec<String>>,
    bucket_checks_until_ready: AtomicUsize,
}

struct FakeManager {
    cluster: Arc<Cluster>,
}

#[async_trait]
impl UserManager for FakeManager {
    async fn upsert_user(&self, name: &str, user: &LocalUser) -> Result<()> {
        self.cluster.users.lock().insert(name.to_string(), user.clone());
        Ok(())
    }

    async fn get_user(&self, name: &str) -> Result<Option<LocalUser>> {
        Ok(self.cluster.users.lock().get(name).map(|u| LocalUser {
            password: String::new(),
            ..u.clone()
        }))
    }

    async fn drop_user(&self, name: &str) -> Result<()> {
        self.cluster.users.lock().remove(name);
        Ok(())
    }

    async fn change_own_password(&self, password: &str) -> Result<()> {
        self.cluster
            .own_password_changes
            .lock()
            .push(password.to_string());
        Ok(())
    }

    async fn bucket_ready(&self, _bucket: &str) -> Result<bool> {
        Ok(self
            .cluster
            .bucket_checks_until_ready
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeConnector {
    cluster: Arc<Cluster>,
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, config: &CouchbaseConfig) -> Result<Arc<dyn UserManager>> {
        self.cluster
            .admin_passwords
            .lock()
            .push(config.password.expose_secret().to_string());
        Ok(Arc::new(FakeManager {
            cluster: Arc::clone(&self.cluster),
        }))
    }
}

async fn setup_with(config: serde_json::Value) -> (Couchbase, Arc<Cluster>) {
    let cluster = Arc::new(Cluster::default());
    let db = Couchbase::with_connector(FakeConnector {
        cluster: Arc::clone(&cluster),
    });
    db.initialize(InitializeRequest {
        config: config.as_object().cloned().unwrap(),
        verify_connection: true,
    })
    .await
    .unwrap();
    (db, cluster)
}

async fn setup() -> (Couchbase, Arc<Cluster>) {
    setup_with(json!({
        "hosts": "couchbase://localhost",
        "username": "Administrator",
        "password": "secret",
    }))
    .await
}

fn new_user(statement: &str) -> NewUserRequest {
    NewUserRequest {
        username_config: UsernameMetadata::new("token", "reader"),
        statements: Statements::new([statement]),
        rollback_statements: Statements::default(),
        credential_type: CredentialType::Password,
        password: SensitiveString::new("pw-1"),
        public_key: None,
        expiration: Utc::now() + Duration::hours(1),
    }
}

fn rotate(username: &str, password: &str) -> UpdateUserRequest {
    UpdateUserRequest {
        username: username.into(),
        credential_type: CredentialType::Password,
        password: Some(ChangePassword {
            new_password: SensitiveString::new(password),
            statements: Statements::default(),
        }),
        public_key: None,
        expiration: None,
    }
}

#[tokio::test]
async fn test_new_user_with_roles_and_groups() {
    let (db, cluster) = setup().await;

    let response = db
        .new_user(new_user(
            r#"{"Roles": [{"role": "data_reader", "bucket_name": "travel"}], "Groups": ["ops"]}"#,
        ))
        .await
        .unwrap();
    assert!(response.username.starts_with("V_TOKEN_READER_"));

    let users = cluster.users.lock();
    let user = &users[&response.username];
    assert_eq!(user.password, "pw-1");
    assert_eq!(user.roles, vec!["data_reader[travel]"]);
    assert_eq!(user.groups, vec!["ops"]);
}

#[tokio::test]
async fn test_new_user_default_role() {
    let (db, cluster) = setup().await;
    let response = db.new_user(new_user("{}")).await.unwrap();
    assert_eq!(cluster.users.lock()[&response.username].roles, vec!["ro_admin"]);
}

#[tokio::test]
async fn test_empty_creation_statements() {
    let (db, _cluster) = setup().await;
    let mut request = new_user("{}");
    request.statements = Statements::default();
    let err = db.new_user(request).await.unwrap_err();
    assert!(matches!(err, Error::EmptyCreationStatements));
}

#[tokio::test]
async fn test_rotation_keeps_roles() {
    let (db, cluster) = setup().await;
    cluster.users.lock().insert(
        "V_APP".into(),
        LocalUser {
            password: "old".into(),
            roles: vec!["bucket_admin[travel]".into()],
            groups: vec![],
        },
    );

    db.update_user(rotate("V_APP", "pw-2")).await.unwrap();

    let users = cluster.users.lock();
    assert_eq!(users["V_APP"].password, "pw-2");
    assert_eq!(users["V_APP"].roles, vec!["bucket_admin[travel]"]);
}

#[tokio::test]
async fn test_rotation_of_missing_user() {
    let (db, _cluster) = setup().await;
    let err = db.update_user(rotate("GHOST", "pw-2")).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::UserNotFound);
}

#[tokio::test]
async fn test_root_rotation_reconnects() {
    let (db, cluster) = setup().await;

    db.update_user(rotate("Administrator", "12345")).await.unwrap();
    db.delete_user(DeleteUserRequest {
        username: "V_APP".into(),
        statements: Statements::default(),
    })
    .await
    .unwrap();

    assert_eq!(*cluster.own_password_changes.lock(), vec!["12345"]);
    assert_eq!(*cluster.admin_passwords.lock(), vec!["secret", "12345"]);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_waits_for_bucket() {
    let cluster = Arc::new(Cluster::default());
    cluster.bucket_checks_until_ready.store(3, Ordering::SeqCst);
    let db = Couchbase::with_connector(FakeConnector {
        cluster: Arc::clone(&cluster),
    });

    db.initialize(InitializeRequest {
        config: json!({
            "hosts": "couchbase://localhost",
            "username": "Administrator",
            "password": "secret",
            "bucket_name": "travel",
        })
        .as_object()
        .cloned()
        .unwrap(),
        verify_connection: true,
    })
    .await
    .unwrap();
    assert_eq!(cluster.bucket_checks_until_ready.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_delete_user() {
    let (db, cluster) = setup().await;
    cluster
        .users
        .lock()
        .insert("V_APP".into(), LocalUser::default());

    db.delete_user(DeleteUserRequest {
        username: "V_APP".into(),
        statements: Statements::default(),
    })
    .await
    .unwrap();
    assert!(cluster.users.lock().is_empty());
}

fn extend(username: &str, statements: &[&str]) -> UpdateUserRequest {
    UpdateUserRequest {
        username: username.into(),
        credential_type: CredentialType::Password,
        password: None,
        public_key: None,
        expiration: Some(ChangeExpiration {
            new_expiration: Utc::now() + Duration::hours(2),
            statements: Statements::new(statements.iter().copied()),
        }),
    }
}

#[tokio::test]
async fn test_expiration_only_update_is_noop() {
    let (db, cluster) = setup().await;
    let name = db.new_user(new_user("{}")).await.unwrap().username;

    db.update_user(extend(&name, &[])).await.unwrap();
    db.update_user(extend("Administrator", &[])).await.unwrap();

    let users = cluster.users.lock();
    assert_eq!(users.len(), 1);
    assert_eq!(users[&name].password, "pw-1");
    assert_eq!(users[&name].roles, vec!["ro_admin"]);
    assert!(cluster.own_password_changes.lock().is_empty());
    assert_eq!(*cluster.admin_passwords.lock(), vec!["secret"]);
}
