//! One-shot offer/answer exchange over a shared directory.
//!
//! Two processes started with the same session name race for a lock file. The winner becomes
//! the initiator: it plays the [Role::Impolite] part, writes the offer and waits for the answer.
//! The other one waits for the offer and answers it. Every file is consumed once read.

use crate::connection::Connection;
use crate::error::Error;
use crate::signal::{Role, SessionDescription};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Paths of the signaling files of a single session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    lock: PathBuf,
    offer: PathBuf,
    answer: PathBuf,
}

impl SessionFiles {
    pub fn new<P: AsRef<Path>>(dir: P, session: &str) -> Self {
        let dir = dir.as_ref();
        SessionFiles {
            lock: dir.join(format!("{}.lock", session)),
            offer: dir.join(format!("{}.offer.json", session)),
            answer: dir.join(format!("{}.answer.json", session)),
        }
    }

    pub fn lock(&self) -> &Path {
        &self.lock
    }

    pub fn offer(&self) -> &Path {
        &self.offer
    }

    pub fn answer(&self) -> &Path {
        &self.answer
    }

    /// Elects the role of this process: the first one to create the lock file is the initiator.
    pub fn elect(&self) -> Result<Role, Error> {
        if elect_initiator(&self.lock)? {
            Ok(Role::Impolite)
        } else {
            Ok(Role::Polite)
        }
    }

    /// Removes offer and answer files left behind by a previous run.
    pub async fn clear_stale(&self) -> Result<(), Error> {
        remove_if_exists(&self.offer).await?;
        remove_if_exists(&self.answer).await
    }

    /// Removes the lock file, so that the session name can be used again.
    pub async fn release(&self) -> Result<(), Error> {
        remove_if_exists(&self.lock).await
    }
}

/// Tries to create the lock file exclusively. Returns false if another process holds it.
pub fn elect_initiator(lock: &Path) -> Result<bool, Error> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock)
    {
        Ok(mut file) => {
            write!(file, "{}", std::process::id())?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Writes `value` as JSON, atomically: readers never observe a partially written file.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let json = serde_json::to_vec(value)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Polls for a JSON file, parses it and removes it.
///
/// A file which can't be parsed yet is retried on the next poll. Fails with [Error::Timeout]
/// once `timeout` passes and with [Error::Cancelled] once `cancel` fires.
pub async fn wait_for_file<T: DeserializeOwned>(
    path: &Path,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<T, Error> {
    let started = Instant::now();
    let mut last_err: Option<Error> = None;
    loop {
        match tokio::fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    remove_if_exists(path).await?;
                    return Ok(value);
                }
                Err(e) => last_err = Some(e.into()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if started.elapsed() >= timeout {
            let reason = match last_err {
                Some(e) => format!("{} (last error: {})", path.display(), e),
                None => path.display().to_string(),
            };
            return Err(Error::Timeout(reason));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Content of the offer and answer files. `run` ties an answer to the offer it responds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sdp: SessionDescription,
    pub run: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeOptions {
    pub timeout: Duration,
    pub poll: Duration,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            timeout: Duration::from_secs(90),
            poll: Duration::from_millis(200),
        }
    }
}

fn run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}", std::process::id(), nanos)
}

/// Runs the offer/answer exchange for a connection, according to the elected `role`.
///
/// Initiator clears stale files first, rejects answers carrying another run id and releases
/// the lock once done, whether the exchange succeeded or not.
pub async fn exchange_via_files(
    files: &SessionFiles,
    conn: &dyn Connection,
    role: Role,
    options: &ExchangeOptions,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    match role {
        Role::Impolite => {
            files.clear_stale().await?;
            let result = offer_and_wait(files, conn, options, cancel).await;
            if let Err(e) = files.release().await {
                log::warn!("failed to release {}: {}", files.lock().display(), e);
            }
            result
        }
        Role::Polite => wait_and_answer(files, conn, options, cancel).await,
    }
}

async fn offer_and_wait(
    files: &SessionFiles,
    conn: &dyn Connection,
    options: &ExchangeOptions,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let run = run_id();
    let offer = conn.create_offer().await?;
    conn.set_local_description(offer.clone()).await?;
    let sdp = conn.local_description().await.unwrap_or(offer);
    write_json(files.offer(), &Envelope { sdp, run: run.clone() }).await?;
    log::info!(
        "initiator (run {}) wrote {}, waiting for answer",
        run,
        files.offer().display()
    );

    let answer: Envelope =
        wait_for_file(files.answer(), options.timeout, options.poll, cancel).await?;
    if answer.run != run {
        return Err(Error::StaleAnswer {
            expected: run,
            got: answer.run,
        });
    }
    conn.set_remote_description(answer.sdp).await?;
    log::info!("initiator applied the answer");
    Ok(())
}

async fn wait_and_answer(
    files: &SessionFiles,
    conn: &dyn Connection,
    options: &ExchangeOptions,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    log::info!("responder waiting for {}", files.offer().display());
    let offer: Envelope = wait_for_file(files.offer(), options.timeout, options.poll, cancel).await?;
    if !offer.sdp.is_offer() {
        return Err(Error::InvalidState("offer file holds no offer".into()));
    }
    conn.set_remote_description(offer.sdp).await?;
    let answer = conn.create_answer().await?;
    conn.set_local_description(answer.clone()).await?;
    let sdp = conn.local_description().await.unwrap_or(answer);
    write_json(files.answer(), &Envelope { sdp, run: offer.run }).await?;
    log::info!("responder wrote {}", files.answer().display());
    Ok(())
}
