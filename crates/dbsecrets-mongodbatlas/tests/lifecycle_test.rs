//! Atlas lifecycle against an in-memory project

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;

use dbsecrets_mongodbatlas::prelude::*;
use dbsecrets_plugin::prelude::*;

#[derive(Default)]
struct Project {
    // (database, username) -> user
    users: Mutex<HashMap<(String, String), DatabaseUser>>,
    api_keys: Mutex<Vec<String>>,
}

struct FakeApi {
    project: Arc<Project>,
}

#[async_trait]
impl DatabaseUsersApi for FakeApi {
    async fn create(&self, user: &DatabaseUser) -> Result<()> {
        let key = (user.database_name.clone(), user.username.clone());
        let mut users = self.project.users.lock();
        if users.contains_key(&key) {
            return Err(Error::statement_with_code(
                "user already exists",
                "USER_ALREADY_EXISTS",
            ));
        }
        users.insert(key, user.clone());
        Ok(())
    }

    async fn update_password(&self, database: &str, username: &str, password: &str) -> Result<()> {
        let mut users = self.project.users.lock();
        let user = users
            .get_mut(&(database.to_string(), username.to_string()))
            .ok_or_else(|| Error::user_not_found(username))?;
        user.password = password.to_string();
        Ok(())
    }

    async fn delete(&self, database: &str, username: &str) -> Result<()> {
        self.project
            .users
            .lock()
            .remove(&(database.to_string(), username.to_string()));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeConnector {
    project: Arc<Project>,
}

#[async_trait]
impl AtlasConnector for FakeConnector {
    async fn connect(&self, config: &AtlasConfig) -> Result<Arc<dyn DatabaseUsersApi>> {
        self.project
            .api_keys
            .lock()
            .push(config.private_key.expose_secret().to_string());
        Ok(Arc::new(FakeApi {
            project: Arc::clone(&self.project),
        }))
    }
}

async fn setup() -> (MongoDbAtlas, Arc<Project>) {
    let project = Arc::new(Project::default());
    let db = MongoDbAtlas::with_connector(FakeConnector {
        project: Arc::clone(&project),
    });
    db.initialize(InitializeRequest {
        config: json!({
            "public_key": "abcdef",
            "private_key": "0123-4567",
            "project_id": "5f1a",
        })
        .as_object()
        .cloned()
        .unwrap(),
        verify_connection: true,
    })
    .await
    .unwrap();
    (db, project)
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

fn insert(project: &Project, database: &str, username: &str) {
    project.users.lock().insert(
        (database.to_string(), username.to_string()),
        DatabaseUser {
            database_name: database.into(),
            group_id: "5f1a".into(),
            username: username.into(),
            password: "old".into(),
            roles: vec![],
            scopes: vec![],
        },
    );
}

#[tokio::test]
async fn test_new_user() {
    let (db, project) = setup().await;

    let response = db
        .new_user(new_user(
            r#"{"roles": [{"databaseName": "sales", "roleName": "readWrite", "collectionName": "orders"}]}"#,
        ))
        .await
        .unwrap();
    assert!(response.username.starts_with("v-token-reader-"));
    assert!(response.username.len() <= 54);

    let users = project.users.lock();
    let user = &users[&("admin".to_string(), response.username.clone())];
    assert_eq!(user.group_id, "5f1a");
    assert_eq!(user.password, "pw-1");
    assert_eq!(user.roles[0].collection_name.as_deref(), Some("orders"));
}

#[tokio::test]
async fn test_new_user_custom_database() {
    let (db, project) = setup().await;
    let response = db
        .new_user(new_user(r#"{"database_name": "$external", "roles": []}"#))
        .await
        .unwrap();
    assert!(project
        .users
        .lock()
        .contains_key(&("$external".to_string(), response.username)));
}

#[tokio::test]
async fn test_invalid_creation_statement() {
    let (db, _project) = setup().await;
    let err = db.new_user(new_user("CREATE USER")).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidRequest);

    let mut request = new_user("{}");
    request.statements = Statements::default();
    let err = db.new_user(request).await.unwrap_err();
    assert!(matches!(err, Error::EmptyCreationStatements));
}

#[tokio::test]
async fn test_update_password() {
    let (db, project) = setup().await;
    insert(&project, "admin", "v-app");

    db.update_user(UpdateUserRequest {
        username: "v-app".into(),
        credential_type: CredentialType::Password,
        password: Some(ChangePassword {
            new_password: SensitiveString::new("pw-2"),
            statements: Statements::default(),
        }),
        public_key: None,
        expiration: None,
    })
    .await
    .unwrap();

    assert_eq!(
        project.users.lock()[&("admin".to_string(), "v-app".to_string())].password,
        "pw-2"
    );
}

#[tokio::test]
async fn test_update_missing_user() {
    let (db, _project) = setup().await;
    let err = db
        .update_user(UpdateUserRequest {
            username: "ghost".into(),
            credential_type: CredentialType::Password,
            password: Some(ChangePassword {
                new_password: SensitiveString::new("pw-2"),
                statements: Statements::default(),
            }),
            public_key: None,
            expiration: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::UserNotFound);
}

#[tokio::test]
async fn test_update_without_changes() {
    let (db, _project) = setup().await;
    let err = db
        .update_user(UpdateUserRequest {
            username: "v-app".into(),
            credential_type: CredentialType::Password,
            password: None,
            public_key: None,
            expiration: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoChanges));
}

#[tokio::test]
async fn test_delete_user() {
    let (db, project) = setup().await;
    insert(&project, "admin", "v-app");
    insert(&project, "$external", "v-ext");

    db.delete_user(DeleteUserRequest {
        username: "v-app".into(),
        statements: Statements::default(),
    })
    .await
    .unwrap();
    db.delete_user(DeleteUserRequest {
        username: "v-ext".into(),
        statements: Statements::new([r#"{"database_name": "$external"}"#]),
    })
    .await
    .unwrap();

    assert!(project.users.lock().is_empty());
}

#[tokio::test]
async fn test_private_key_is_redacted() {
    let (db, project) = setup().await;
    assert_eq!(*project.api_keys.lock(), vec!["0123-4567"]);
    assert_eq!(
        db.secret_values().redact("auth failed for 0123-4567"),
        "auth failed for [private_key]"
    );
    db.close().await.unwrap();
    db.close().await.unwrap();
}
