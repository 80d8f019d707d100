use crate::server::{AuthProvider, TokenAuth};

#[tokio::test]
async fn test_issue_and_verify_round_trip() {
    let auth = TokenAuth::new("secret");
    let reply = auth.authenticate("alice", "pw", "laptop").await.unwrap();
    assert_eq!(reply.user.username, "alice");

    let user = auth.verify(&reply.token).unwrap();
    assert_eq!(user.id, "alice");
}

#[tokio::test]
async fn test_empty_credentials_rejected() {
    let auth = TokenAuth::new("secret");
    assert!(auth.authenticate("", "pw", "d").await.is_err());
    assert!(auth.authenticate("alice", "", "d").await.is_err());
}

#[test]
fn test_wrong_secret_rejected() {
    let issuer = TokenAuth::new("secret-a");
    let verifier = TokenAuth::new("secret-b");
    let token = issuer.issue("alice", "d").unwrap().token;
    assert!(verifier.verify(&token).is_err());
    assert!(issuer.verify(&token).is_ok());
}

#[test]
fn test_garbage_token_rejected() {
    let auth = TokenAuth::new("secret");
    assert!(auth.verify("not.a.token").is_err());
    assert!(auth.verify("").is_err());
}
