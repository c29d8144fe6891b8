// ── Session worker ───────────────────────────────────────────────────────────
//
// A Session and everything derived from it are used from one thread at a
// time.  The worker owns that thread and feeds it closures from async code.

use log::{info, warn};
use sshkit_core::{SshError, SshResult};
use sshkit_ssh::Session;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce(&Session) + Send>;

enum Command {
    Run(Job),
    /// Close the session after whatever is running now.
    Abort,
    Shutdown(oneshot::Sender<SshResult<()>>),
}

pub struct SessionWorker {
    session_id: String,
    tx: mpsc::UnboundedSender<Command>,
    aborted: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Move `session` onto a dedicated thread.
    pub fn spawn(session: Session) -> SshResult<Self> {
        let session_id = session.id().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let thread = std::thread::Builder::new()
            .name(format!("sshkit-{}", &session_id[..8.min(session_id.len())]))
            .spawn(move || {
                let mut closed = false;
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        Command::Run(job) => job(&session),
                        Command::Abort => {
                            if !closed {
                                closed = true;
                                if let Err(e) = session.close(Some("deadline exceeded")) {
                                    warn!("[{}] close after abort failed: {}", session.id(), e);
                                }
                            }
                        }
                        Command::Shutdown(ack) => {
                            let result = if closed { Ok(()) } else { session.close(None) };
                            let _ = ack.send(result);
                            return;
                        }
                    }
                }
                if !closed {
                    if let Err(e) = session.close(None) {
                        warn!("[{}] close on worker exit failed: {}", session.id(), e);
                    }
                }
            })
            .map_err(|e| SshError::io(format!("failed to spawn session worker: {}", e)))?;
        info!("[{}] session worker started", session_id);
        Ok(Self {
            session_id,
            tx,
            aborted: Arc::new(AtomicBool::new(false)),
            thread: Some(thread),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once a deadline has been missed; every later job fails.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn submit<T, F>(&self, f: F) -> SshResult<oneshot::Receiver<SshResult<T>>>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> SshResult<T> + Send + 'static,
    {
        if self.is_aborted() {
            return Err(aborted_error());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let aborted = self.aborted.clone();
        let job: Job = Box::new(move |session| {
            let result = if aborted.load(Ordering::SeqCst) {
                Err(aborted_error())
            } else {
                f(session)
            };
            let _ = reply_tx.send(result);
        });
        self.tx
            .send(Command::Run(job))
            .map_err(|_| SshError::connection("session worker has stopped"))?;
        Ok(reply_rx)
    }

    /// Run `f` against the session on the worker thread.
    pub async fn run<T, F>(&self, f: F) -> SshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> SshResult<T> + Send + 'static,
    {
        let reply = self.submit(f)?;
        reply
            .await
            .map_err(|_| SshError::connection("session worker dropped the job"))?
    }

    /// Like [`SessionWorker::run`], bounded by `deadline`.  When the deadline
    /// passes the session is marked aborted and closed as soon as the
    /// in-flight call returns.
    pub async fn run_with_deadline<T, F>(&self, f: F, deadline: Duration) -> SshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> SshResult<T> + Send + 'static,
    {
        let reply = self.submit(f)?;
        match tokio::time::timeout(deadline, reply).await {
            Ok(result) => {
                result.map_err(|_| SshError::connection("session worker dropped the job"))?
            }
            Err(_) => {
                self.aborted.store(true, Ordering::SeqCst);
                warn!(
                    "[{}] operation exceeded {:?}; aborting session",
                    self.session_id, deadline
                );
                let _ = self.tx.send(Command::Abort);
                Err(SshError::connection(format!(
                    "operation exceeded deadline of {:?}",
                    deadline
                )))
            }
        }
    }

    /// Close the session and stop the thread.
    pub async fn shutdown(mut self) -> SshResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(ack_tx))
            .map_err(|_| SshError::connection("session worker has stopped"))?;
        let result = ack_rx
            .await
            .map_err(|_| SshError::connection("session worker exited before shutdown"))?;
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| SshError::connection("session worker panicked"))?;
        }
        info!("[{}] session worker stopped", self.session_id);
        result
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        // The thread closes the session once the queue is drained.
        if self.thread.is_some() {
            let (ack_tx, _ack_rx) = oneshot::channel();
            let _ = self.tx.send(Command::Shutdown(ack_tx));
        }
    }
}

impl std::fmt::Debug for SessionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWorker")
            .field("session_id", &self.session_id)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

fn aborted_error() -> SshError {
    SshError::connection("session was aborted after a missed deadline")
}
