//! `http-01` challenge responder: a tiny HTTP server whose only job is to
//! answer `/.well-known/acme-challenge/{token}` with whatever key
//! authorization the client most recently provisioned for that token.

use std::thread;

use log::info;

use crate::error::Result;
use crate::store::{KVStore, Tripwire};

const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

pub struct HttpResponder {
    store: KVStore,
}

impl HttpResponder {
    /// Binds `0.0.0.0:<port>` and spawns the serving thread. `rouille::start_server`
    /// blocks forever, so it gets its own thread the same way the DNS
    /// responder gets its own UDP-serving thread.
    pub fn start(port: u16) -> Result<Self> {
        let store = KVStore::new();
        let worker_store = store.clone();
        let addr = format!("0.0.0.0:{}", port);

        thread::spawn(move || {
            rouille::start_server(addr, move |request| {
                let token = request
                    .url()
                    .strip_prefix(CHALLENGE_PATH_PREFIX)
                    .unwrap_or("")
                    .to_string();
                let value = worker_store.get(token).unwrap_or_default();
                rouille::Response::text(value)
            });
        });

        info!("http-01 responder listening on tcp/{}", port);
        Ok(HttpResponder { store })
    }

    pub fn add_challenge_path(
        &self,
        token: impl Into<String>,
        key_authorization: impl Into<String>,
    ) -> Result<Tripwire> {
        self.store.set(token, key_authorization)
    }

    pub fn del_challenge_path(&self, token: impl Into<String>) -> Result<()> {
        self.store.del(token)
    }
}
