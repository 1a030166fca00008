//! Signed customer identities.
//!
//! The application that logs customers in hands the widget a `userToken`
//! per user id: `<expiry>.<hex HMAC-SHA256 of "<userId>:<expiry>">`, keyed
//! with the shared identity secret, expiry in unix seconds.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

fn user_mac(secret: &str, user_id: &str, exp: i64) -> Option<Hmac<Sha256>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(format!("{user_id}:{exp}").as_bytes());
    Some(mac)
}

pub fn sign_user_token(secret: &str, user_id: &str, exp: i64) -> Option<String> {
    if secret.is_empty() || user_id.trim().is_empty() {
        return None;
    }
    let mac = user_mac(secret, user_id.trim(), exp)?;
    Some(format!("{exp}.{}", hex::encode(mac.finalize().into_bytes())))
}

/// An empty secret verifies nothing.
pub fn verify_user_token(secret: &str, user_id: &str, token: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some((exp, signature)) = token.trim().split_once('.') else {
        return false;
    };
    let Ok(exp) = exp.parse::<i64>() else {
        return false;
    };
    if exp < Utc::now().timestamp() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Some(mac) = user_mac(secret, user_id.trim(), exp) else {
        return false;
    };
    mac.verify_slice(&signature_bytes).is_ok()
}
