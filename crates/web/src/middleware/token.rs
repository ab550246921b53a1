//! Signed token cookies.
//!
//! A token is the URL-safe base64 (no padding) encoding of:
//!
//! ```text
//! [0..8)   issue time, unix seconds, little endian
//! [8..12)  max age in seconds, little endian
//! [12..44) HMAC-SHA256 over bytes [0..12) followed by the payload
//! [44..)   payload
//! ```

use crate::clock::{Clock, SystemClock};
use crate::context::Context;
use crate::error::{Error, Result, StatusError};
use crate::handler::Handler;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use cookie::{Cookie, SameSite};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const PREFIX_LEN: usize = 12;
const HEADER_LEN: usize = PREFIX_LEN + 32;

/// A value carried inside a token.
pub trait Payload: Sized + Send + Sync + 'static {
    fn encode(&self) -> Result<Vec<u8>>;

    fn decode(bytes: &[u8]) -> Result<Self>;
}

impl Payload for Bytes {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

impl Payload for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

/// A payload stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Record<'a> {
    stamp: u64,
    age: u32,
    payload: &'a [u8],
}

/// Issues, checks and revokes token cookies.
pub struct TokenManager {
    name: String,
    path: String,
    secure: bool,
    // keyed once, cloned per operation
    mac: HmacSha256,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub fn new(name: impl Into<String>, path: impl Into<String>, secure: bool, key: &[u8]) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(key).map_err(|e| Error::other(e.to_string()))?;
        Ok(Self { name: name.into(), path: path.into(), secure, mac, clock: Arc::new(SystemClock) })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The cookie name, also the key the checked payload is attached under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Issues a token valid for `age` seconds and sets it as a cookie.
    pub fn create<P: Payload>(&self, ctx: &Context, age: u32, payload: &P) -> Result<()> {
        let payload = payload.encode()?;
        self.issue(ctx, age, &payload)
    }

    /// Removes the token cookie from the client.
    pub fn delete(&self, ctx: &Context) -> Result<()> {
        ctx.set_cookie(&self.cookie(String::new(), 0))
    }

    /// A middleware admitting only requests that carry a valid token.
    ///
    /// The decoded payload is attached to the context under [`name`](Self::name). With
    /// `renew`, a token older than half its age is re-issued with a fresh stamp.
    pub fn checker<P: Payload>(self: &Arc<Self>, renew: bool) -> TokenChecker<P> {
        TokenChecker { manager: Arc::clone(self), renew, _payload: PhantomData }
    }

    fn now(&self) -> u64 {
        self.clock.now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
    }

    fn issue(&self, ctx: &Context, age: u32, payload: &[u8]) -> Result<()> {
        let value = self.seal(self.now(), age, payload);
        ctx.set_cookie(&self.cookie(value, i64::from(age)))
    }

    fn cookie(&self, value: String, max_age: i64) -> Cookie<'static> {
        Cookie::build((self.name.clone(), value))
            .path(self.path.clone())
            .max_age(cookie::time::Duration::seconds(max_age))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .build()
    }

    fn seal(&self, stamp: u64, age: u32, payload: &[u8]) -> String {
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&stamp.to_le_bytes());
        buf.extend_from_slice(&age.to_le_bytes());

        let mut mac = self.mac.clone();
        mac.update(&buf);
        mac.update(payload);
        buf.extend_from_slice(&mac.finalize().into_bytes());
        buf.extend_from_slice(payload);
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Decodes and authenticates a token. The tag is compared in constant time.
    fn open<'a>(&self, buf: &'a [u8]) -> Option<Record<'a>> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let (prefix, rest) = buf.split_at(PREFIX_LEN);
        let (tag, payload) = rest.split_at(HEADER_LEN - PREFIX_LEN);

        let mut mac = self.mac.clone();
        mac.update(prefix);
        mac.update(payload);
        mac.verify_slice(tag).ok()?;

        let (stamp, age) = prefix.split_at(8);
        Some(Record {
            stamp: u64::from_le_bytes(stamp.try_into().ok()?),
            age: u32::from_le_bytes(age.try_into().ok()?),
            payload,
        })
    }

    fn check<P: Payload>(&self, ctx: &Context, renew: bool) -> Result<P> {
        let denied = |reason: &str| -> Error { StatusError::unauthorized(format!("{}: {reason}", self.name)).into() };

        let value = ctx.cookie(&self.name).ok_or_else(|| denied("missing"))?;
        let buf = URL_SAFE_NO_PAD.decode(value).map_err(|e| denied(&e.to_string()))?;
        let record = self.open(&buf).ok_or_else(|| denied("invalid"))?;

        let elapsed = self.now().cast_signed() - record.stamp.cast_signed();
        if elapsed > i64::from(record.age) {
            return Err(denied("expired"));
        }
        let payload = P::decode(record.payload).map_err(|e| denied(&e.to_string()))?;
        if renew && elapsed > i64::from(record.age / 2) {
            debug!(name = %self.name, elapsed, "renewing token");
            self.issue(ctx, record.age, record.payload)?;
        }
        Ok(payload)
    }
}

/// Middleware produced by [`TokenManager::checker`].
pub struct TokenChecker<P> {
    manager: Arc<TokenManager>,
    renew: bool,
    _payload: PhantomData<fn() -> P>,
}

impl<P> fmt::Debug for TokenChecker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenChecker").field("manager", &self.manager).field("renew", &self.renew).finish()
    }
}

#[async_trait]
impl<P: Payload> Handler for TokenChecker<P> {
    async fn call(&self, ctx: Context) -> Result<()> {
        match self.manager.check::<P>(&ctx, self.renew) {
            Ok(payload) => {
                ctx.set(self.manager.name.clone(), payload);
                ctx.next().await
            }
            Err(e) => {
                self.manager.delete(&ctx)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Json, Record, TokenManager, HEADER_LEN};
    use crate::clock::MockClock;
    use crate::context::Context;
    use crate::router::Router;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use http_body_util::{BodyExt, Empty};
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    const T0: u64 = 1_700_000_000;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn manager() -> (Arc<Mutex<SystemTime>>, Arc<TokenManager>) {
        let now = Arc::new(Mutex::new(UNIX_EPOCH + Duration::from_secs(T0)));
        let cell = Arc::clone(&now);
        let mut clock = MockClock::new();
        clock.expect_now().returning(move || *cell.lock().unwrap());
        let manager = TokenManager::new("sid", "/", true, b"secret key").unwrap().with_clock(Arc::new(clock));
        (now, Arc::new(manager))
    }

    fn set_clock(now: &Mutex<SystemTime>, secs: u64) {
        *now.lock().unwrap() = UNIX_EPOCH + Duration::from_secs(T0 + secs);
    }

    /// A router issuing a token on `/login` and guarding `/me` with a renewing checker.
    fn router(manager: &Arc<TokenManager>) -> Arc<Router> {
        let mut router = Router::new();
        let issuer = Arc::clone(manager);
        router.get("/login", move |ctx: Context| {
            let issuer = Arc::clone(&issuer);
            async move {
                issuer.create(&ctx, 100, &Json(User { id: 7, name: "ann".into() }))?;
                ctx.text("welcome")
            }
        });
        router.route("/me").middleware(manager.checker::<Json<User>>(true));
        router.get("/me", |ctx: Context| async move {
            let user = ctx.get::<Json<User>>("sid").map(|u| u.0.name.clone()).unwrap_or_default();
            ctx.text(user)
        });
        Arc::new(router)
    }

    async fn call(router: &Arc<Router>, path: &str, token: Option<&str>) -> (StatusCode, Option<String>, String) {
        let mut builder = Request::builder().uri(path);
        if let Some(token) = token {
            builder = builder.header("cookie", format!("sid={token}"));
        }
        let resp = router.serve(builder.body(Empty::<Bytes>::new()).unwrap(), None).await;
        let status = resp.status();
        let set_cookie = resp.headers().get("set-cookie").map(|v| v.to_str().unwrap().to_owned());
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, set_cookie, String::from_utf8(body.to_vec()).unwrap())
    }

    fn cookie_value(set_cookie: &str) -> String {
        cookie::Cookie::parse(set_cookie).unwrap().value().to_owned()
    }

    fn stamp(token: &str) -> u64 {
        let buf = URL_SAFE_NO_PAD.decode(token).unwrap();
        u64::from_le_bytes(buf[..8].try_into().unwrap())
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (_, manager) = manager();
        let token = manager.seal(T0, 100, b"payload");
        let buf = URL_SAFE_NO_PAD.decode(&token).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + 7);
        assert_eq!(manager.open(&buf), Some(Record { stamp: T0, age: 100, payload: b"payload" }));
    }

    #[test]
    fn test_every_flipped_bit_is_rejected() {
        let (_, manager) = manager();
        let buf = URL_SAFE_NO_PAD.decode(manager.seal(T0, 100, b"xy")).unwrap();
        for i in 0..buf.len() * 8 {
            let mut tampered = buf.clone();
            tampered[i / 8] ^= 1 << (i % 8);
            assert!(manager.open(&tampered).is_none(), "bit {i}");
        }
        assert!(manager.open(&buf[..HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn test_other_key_is_rejected() {
        let (_, manager) = manager();
        let other = TokenManager::new("sid", "/", true, b"other key").unwrap();
        let buf = URL_SAFE_NO_PAD.decode(manager.seal(T0, 100, b"xy")).unwrap();
        assert!(other.open(&buf).is_none());
    }

    #[tokio::test]
    async fn test_cookie_attributes() {
        let (_, manager) = manager();
        let router = router(&manager);

        let (status, set_cookie, _) = call(&router, "/login", None).await;
        assert_eq!(status, StatusCode::OK);
        let set_cookie = set_cookie.unwrap();
        for attribute in ["Path=/", "Max-Age=100", "HttpOnly", "Secure", "SameSite=Strict"] {
            assert!(set_cookie.contains(attribute), "{set_cookie} lacks {attribute}");
        }
    }

    #[tokio::test]
    async fn test_check_lifecycle() {
        let (now, manager) = manager();
        let router = router(&manager);
        let token = cookie_value(&call(&router, "/login", None).await.1.unwrap());
        assert_eq!(stamp(&token), T0);

        set_clock(&now, 30);
        let (status, set_cookie, body) = call(&router, "/me", Some(&token)).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "ann"));
        assert!(set_cookie.is_none());

        set_clock(&now, 60);
        let (status, set_cookie, _) = call(&router, "/me", Some(&token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stamp(&cookie_value(&set_cookie.unwrap())), T0 + 60);

        set_clock(&now, 101);
        let (status, set_cookie, _) = call(&router, "/me", Some(&token)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(set_cookie.unwrap().contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn test_missing_and_garbage_tokens() {
        let (_, manager) = manager();
        let router = router(&manager);

        assert_eq!(call(&router, "/me", None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(call(&router, "/me", Some("not*base64")).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(call(&router, "/me", Some("c2hvcnQ")).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_payload_type_mismatch_is_unauthorized() {
        let (_, manager) = manager();
        let token = manager.seal(T0, 100, b"not json");
        let router = router(&manager);
        assert_eq!(call(&router, "/me", Some(&token)).await.0, StatusCode::UNAUTHORIZED);
    }
}
