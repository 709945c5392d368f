use bytes::Bytes;

use crate::protocol::resp::{RespValue, CMD_AUTH};
use crate::utils::{decode_base62, TENANT_KEY_SEPARATOR};

/// Credentials carried by a session.
///
/// The tenant code is decoded from the base62 prefix of the AUTH username
/// (`<tenantKey>.<username>`). The password is `None` while the AUTH relay
/// is still in flight; it is committed once the backend acknowledges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: Bytes,
    pub password: Option<Bytes>,
    pub tenant_code: u64,
}

impl AuthInfo {
    /// Parse an AUTH frame. Returns `None` for anything that is not an
    /// AUTH command of arity 2 or 3.
    pub fn from_frame(frame: &RespValue) -> Option<AuthInfo> {
        if !frame.is_auth_cmd() {
            return None;
        }
        let items = match frame {
            RespValue::Array(items) => items,
            _ => return None,
        };
        match items.len() {
            2 => {
                // password-only AUTH, default user
                let password = Bytes::copy_from_slice(items[1].payload()?);
                Some(AuthInfo {
                    username: Bytes::new(),
                    password: Some(password),
                    tenant_code: 0,
                })
            }
            3 => {
                let user = items[1].payload()?;
                let password = Bytes::copy_from_slice(items[2].payload()?);
                let (tenant_code, username) =
                    match user.iter().position(|&b| b == TENANT_KEY_SEPARATOR) {
                        Some(idx) => (
                            decode_base62(&user[..idx]).unwrap_or(0),
                            Bytes::copy_from_slice(&user[idx + 1..]),
                        ),
                        None => (0, Bytes::copy_from_slice(user)),
                    };
                Some(AuthInfo {
                    username,
                    password: Some(password),
                    tenant_code,
                })
            }
            _ => None,
        }
    }

    /// The same credentials without the password, stored on the session
    /// while the backend AUTH round trip is outstanding.
    pub fn tentative(&self) -> AuthInfo {
        AuthInfo {
            username: self.username.clone(),
            password: None,
            tenant_code: self.tenant_code,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.password.is_some()
    }
}

/// Build an AUTH frame to relay to a backend. `username: None` produces
/// the two-argument password-only form.
pub fn auth_frame(username: Option<Bytes>, password: Bytes) -> RespValue {
    let mut parts = Vec::with_capacity(3);
    parts.push(RespValue::BulkString(Bytes::from_static(CMD_AUTH)));
    if let Some(username) = username {
        parts.push(RespValue::BulkString(username));
    }
    parts.push(RespValue::BulkString(password));
    RespValue::Array(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::encode_base62;

    fn auth_cmd(parts: &[&[u8]]) -> RespValue {
        RespValue::command_frame(parts.iter().map(|p| Bytes::copy_from_slice(p)))
    }

    #[test]
    fn parses_tenant_prefixed_username() {
        let tenant = encode_base62(987_654_321);
        let user = format!("{tenant}.admin");
        let info = AuthInfo::from_frame(&auth_cmd(&[b"AUTH", user.as_bytes(), b"secret"])).unwrap();
        assert_eq!(info.username.as_ref(), b"admin");
        assert_eq!(info.password.as_deref(), Some(&b"secret"[..]));
        assert_eq!(info.tenant_code, 987_654_321);
    }

    #[test]
    fn username_without_separator_has_zero_tenant() {
        let info = AuthInfo::from_frame(&auth_cmd(&[b"AUTH", b"admin", b"secret"])).unwrap();
        assert_eq!(info.username.as_ref(), b"admin");
        assert_eq!(info.tenant_code, 0);
    }

    #[test]
    fn password_only_auth() {
        let info = AuthInfo::from_frame(&auth_cmd(&[b"AUTH", b"secret"])).unwrap();
        assert!(info.username.is_empty());
        assert_eq!(info.password.as_deref(), Some(&b"secret"[..]));
        assert_eq!(info.tenant_code, 0);
    }

    #[test]
    fn invalid_tenant_key_decodes_to_zero() {
        let info = AuthInfo::from_frame(&auth_cmd(&[b"AUTH", b"!!!.admin", b"secret"])).unwrap();
        assert_eq!(info.tenant_code, 0);
        assert_eq!(info.username.as_ref(), b"admin");
    }

    #[test]
    fn non_auth_frames_are_rejected() {
        assert!(AuthInfo::from_frame(&auth_cmd(&[b"GET", b"key"])).is_none());
        assert!(AuthInfo::from_frame(&auth_cmd(&[b"AUTH"])).is_none());
        assert!(AuthInfo::from_frame(&auth_cmd(&[b"AUTH", b"a", b"b", b"c"])).is_none());
    }

    #[test]
    fn auth_frame_round_trips_through_parser() {
        let frame = auth_frame(Some(Bytes::from_static(b"user")), Bytes::from_static(b"pw"));
        let info = AuthInfo::from_frame(&frame).unwrap();
        assert_eq!(info.username.as_ref(), b"user");
        assert_eq!(info.password.as_deref(), Some(&b"pw"[..]));
        assert_eq!(info.tenant_code, 0);

        let frame = auth_frame(None, Bytes::from_static(b"pw"));
        let info = AuthInfo::from_frame(&frame).unwrap();
        assert!(info.username.is_empty());
        assert_eq!(info.password.as_deref(), Some(&b"pw"[..]));
    }

    #[test]
    fn tentative_drops_password_only() {
        let info = AuthInfo::from_frame(&auth_cmd(&[b"AUTH", b"0.admin", b"pw"])).unwrap();
        let tentative = info.tentative();
        assert_eq!(tentative.username, info.username);
        assert_eq!(tentative.tenant_code, info.tenant_code);
        assert!(!tentative.is_complete());
        assert!(info.is_complete());
    }
}
