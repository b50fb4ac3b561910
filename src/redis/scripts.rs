//! Lua scripts for atomic lock operations
//!
//! A lock is a plain string key whose value is the holder's token. Anything
//! that must check the token and act on the key in one step runs as a script.
//!
//! # Scripts Provided
//!
//! - `acquire_lock`: take the key, or refresh it if it already holds our token
//! - `extend_lock`: push the expiry out only while the key holds our token
//! - `release_lock`: delete the key only if it still holds our token

use parking_lot::RwLock;
use redis::Script;
use std::collections::HashMap;
use std::sync::Arc;

/// Cache of the lock scripts
///
/// `Script` carries the SHA used for `EVALSHA`; sharing one instance avoids
/// rehashing the source on every call.
#[derive(Default)]
pub struct LuaScripts {
    cache: RwLock<HashMap<&'static str, Arc<Script>>>,
}

impl LuaScripts {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, name: &'static str, lua: &str) -> Arc<Script> {
        if let Some(script) = self.cache.read().get(name) {
            return Arc::clone(script);
        }

        let mut cache = self.cache.write();
        Arc::clone(
            cache
                .entry(name)
                .or_insert_with(|| Arc::new(Script::new(lua))),
        )
    }

    /// Set-if-absent that treats our own token as success
    ///
    /// A retried `SET NX` whose first attempt already landed must not be
    /// mistaken for contention.
    ///
    /// # Keys
    /// - KEYS[1]: lock name
    ///
    /// # Arguments
    /// - ARGV[1]: holder token
    /// - ARGV[2]: lease in milliseconds
    ///
    /// # Returns
    /// - 1 if the lock is now held with our token
    /// - 0 if another holder owns it
    pub fn acquire_lock(&self) -> Arc<Script> {
        self.get_or_create(
            "acquire_lock",
            r#"
            if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
                return 1
            end
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('PEXPIRE', KEYS[1], ARGV[2])
                return 1
            end
            return 0
            "#,
        )
    }

    /// Compare-and-expire
    ///
    /// # Keys
    /// - KEYS[1]: lock name
    ///
    /// # Arguments
    /// - ARGV[1]: holder token
    /// - ARGV[2]: lease in milliseconds
    ///
    /// # Returns
    /// - 1 if the lease was extended
    /// - 0 if it expired or another holder owns it
    pub fn extend_lock(&self) -> Arc<Script> {
        self.get_or_create(
            "extend_lock",
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('PEXPIRE', KEYS[1], ARGV[2])
            end
            return 0
            "#,
        )
    }

    /// Compare-and-delete
    ///
    /// # Keys
    /// - KEYS[1]: lock name
    ///
    /// # Arguments
    /// - ARGV[1]: holder token
    ///
    /// # Returns
    /// - 1 if the lock was ours and is now gone
    /// - 0 if it expired or another holder owns it
    pub fn release_lock(&self) -> Arc<Script> {
        self.get_or_create(
            "release_lock",
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        )
    }
}
