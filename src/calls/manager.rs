//! Owns the calls of a client. Each call runs in its own task and is driven
//! through a [`CallHandle`].

use log::{debug, info, warn};
use sfucore::crypto::MediaKey;
use sfucore::types::{AvFlags, CallId, ChatId, Cid, KeyId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::call::{Call, CallConfig, CallDeps, CallSnapshot};
use super::error::CallError;
use super::initiator::SessionInitiator;
use super::keys::MediaKeyCrypto;
use super::media::MediaEngine;
use super::observer::CallObserver;
use crate::relay::{RelayConnector, RelayEvent};

const REQUEST_QUEUE: usize = 32;
const RELAY_EVENT_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Requests handled by a call task.
#[derive(Debug)]
pub enum CallRequest {
    Join {
        av: AvFlags,
        reply: Reply<()>,
    },
    Hangup {
        reply: Reply<()>,
    },
    AbortReconnect {
        reply: Reply<()>,
    },
    RequestSpeaker {
        add: bool,
        reply: Reply<()>,
    },
    ApproveSpeakRequest {
        cid: Cid,
        allow: bool,
        reply: Reply<()>,
    },
    StopSpeak {
        cid: Cid,
        reply: Reply<()>,
    },
    RequestHighResolution {
        cid: Cid,
        quality: u8,
        reply: Reply<()>,
    },
    StopHighResolution {
        cids: Vec<Cid>,
        reply: Reply<()>,
    },
    RequestLowResolution {
        cids: Vec<Cid>,
        reply: Reply<()>,
    },
    StopLowResolution {
        cids: Vec<Cid>,
        reply: Reply<()>,
    },
    SetHiresQuality {
        cid: Cid,
        quality: u8,
        reply: Reply<()>,
    },
    SetLayer {
        spatial: u8,
        temporal: u8,
        screen_temporal: u8,
        reply: Reply<()>,
    },
    UpdateAvFlags {
        av: AvFlags,
        reply: Reply<()>,
    },
    RotateKey {
        reply: Reply<KeyId>,
    },
    AddParticipant {
        user: UserId,
        reply: Reply<bool>,
    },
    RemoveParticipant {
        user: UserId,
        reply: Reply<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable access to a running call.
#[derive(Clone)]
pub struct CallHandle {
    call_id: CallId,
    requests: mpsc::Sender<CallRequest>,
    cancel: CancellationToken,
}

impl CallHandle {
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> CallRequest,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }

    pub async fn join(&self, av: AvFlags) -> Result<(), CallError> {
        self.request(|reply| CallRequest::Join { av, reply }).await
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(|reply| CallRequest::Hangup { reply }).await
    }

    pub async fn abort_reconnect(&self) -> Result<(), CallError> {
        self.request(|reply| CallRequest::AbortReconnect { reply })
            .await
    }

    pub async fn request_speaker(&self, add: bool) -> Result<(), CallError> {
        self.request(|reply| CallRequest::RequestSpeaker { add, reply })
            .await
    }

    pub async fn approve_speak_request(&self, cid: Cid, allow: bool) -> Result<(), CallError> {
        self.request(|reply| CallRequest::ApproveSpeakRequest { cid, allow, reply })
            .await
    }

    pub async fn stop_speak(&self, cid: Cid) -> Result<(), CallError> {
        self.request(|reply| CallRequest::StopSpeak { cid, reply })
            .await
    }

    pub async fn request_high_resolution_video(
        &self,
        cid: Cid,
        quality: u8,
    ) -> Result<(), CallError> {
        self.request(|reply| CallRequest::RequestHighResolution {
            cid,
            quality,
            reply,
        })
        .await
    }

    pub async fn stop_high_resolution_video(&self, cids: Vec<Cid>) -> Result<(), CallError> {
        self.request(|reply| CallRequest::StopHighResolution { cids, reply })
            .await
    }

    pub async fn request_low_resolution_video(&self, cids: Vec<Cid>) -> Result<(), CallError> {
        self.request(|reply| CallRequest::RequestLowResolution { cids, reply })
            .await
    }

    pub async fn stop_low_resolution_video(&self, cids: Vec<Cid>) -> Result<(), CallError> {
        self.request(|reply| CallRequest::StopLowResolution { cids, reply })
            .await
    }

    pub async fn request_hires_quality(&self, cid: Cid, quality: u8) -> Result<(), CallError> {
        self.request(|reply| CallRequest::SetHiresQuality {
            cid,
            quality,
            reply,
        })
        .await
    }

    pub async fn set_layer(
        &self,
        spatial: u8,
        temporal: u8,
        screen_temporal: u8,
    ) -> Result<(), CallError> {
        self.request(|reply| CallRequest::SetLayer {
            spatial,
            temporal,
            screen_temporal,
            reply,
        })
        .await
    }

    pub async fn update_av_flags(&self, av: AvFlags) -> Result<(), CallError> {
        self.request(|reply| CallRequest::UpdateAvFlags { av, reply })
            .await
    }

    pub async fn generate_and_send_new_key(&self) -> Result<KeyId, CallError> {
        self.request(|reply| CallRequest::RotateKey { reply }).await
    }

    pub async fn add_participant(&self, user: UserId) -> Result<bool, CallError> {
        self.request(|reply| CallRequest::AddParticipant { user, reply })
            .await
    }

    pub async fn remove_participant(&self, user: UserId) -> Result<bool, CallError> {
        self.request(|reply| CallRequest::RemoveParticipant { user, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(CallRequest::Snapshot { reply: tx })
            .await
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)
    }

    /// Tears the call down. Pending operations of the call are interrupted.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let (tx, rx) = oneshot::channel();
        if self
            .requests
            .send(CallRequest::Destroy { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Services shared by every call of a client.
#[derive(Clone)]
pub struct CallServices {
    pub initiator: Arc<dyn SessionInitiator>,
    pub connector: Arc<dyn RelayConnector>,
    pub keys: Arc<MediaKeyCrypto>,
    pub observer: Arc<dyn CallObserver>,
}

pub struct CallManager {
    my_user: UserId,
    config: CallConfig,
    services: CallServices,
    calls: Arc<RwLock<HashMap<CallId, CallHandle>>>,
}

impl CallManager {
    pub fn new(my_user: UserId, config: CallConfig, services: CallServices) -> Self {
        Self {
            my_user,
            config,
            services,
            calls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Starts a call task, or returns the handle of the running one.
    pub async fn create_call(
        &self,
        chat_id: ChatId,
        call_id: CallId,
        engine: Arc<dyn MediaEngine>,
        call_key: Option<MediaKey>,
    ) -> CallHandle {
        let mut calls = self.calls.write().await;
        if let Some(existing) = calls.get(&call_id)
            && !existing.is_closed()
        {
            debug!(target: "CallManager", "call {call_id} already exists");
            return existing.clone();
        }

        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(RELAY_EVENT_QUEUE);
        let cancel = CancellationToken::new();
        let deps = CallDeps {
            initiator: self.services.initiator.clone(),
            connector: self.services.connector.clone(),
            engine,
            keys: self.services.keys.clone(),
            observer: self.services.observer.clone(),
        };
        let call = Call::new(
            chat_id,
            call_id.clone(),
            self.my_user.clone(),
            call_key,
            self.config.clone(),
            deps,
            events_tx,
            cancel.clone(),
        );

        let handle = CallHandle {
            call_id: call_id.clone(),
            requests: requests_tx,
            cancel,
        };
        calls.insert(call_id.clone(), handle.clone());
        info!(target: "CallManager", "call {call_id} created");

        let registry = self.calls.clone();
        tokio::spawn(async move {
            run_call(call, requests_rx, events_rx).await;
            let mut calls = registry.write().await;
            if calls.get(&call_id).is_some_and(CallHandle::is_closed) {
                calls.remove(&call_id);
            }
            debug!(target: "CallManager", "call {call_id} task finished");
        });
        handle
    }

    pub async fn get(&self, call_id: &CallId) -> Option<CallHandle> {
        self.calls.read().await.get(call_id).cloned()
    }

    pub async fn call_ids(&self) -> Vec<CallId> {
        self.calls.read().await.keys().cloned().collect()
    }

    pub async fn destroy_call(&self, call_id: &CallId) -> Result<(), CallError> {
        let handle = self
            .calls
            .write()
            .await
            .remove(call_id)
            .ok_or_else(|| CallError::NotFound(format!("call {call_id}")))?;
        handle.destroy().await;
        Ok(())
    }

    /// Destroys every call.
    pub async fn shutdown(&self) {
        let handles: Vec<CallHandle> = self.calls.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.destroy().await;
        }
    }
}

async fn run_call(
    mut call: Call,
    mut requests: mpsc::Receiver<CallRequest>,
    mut relay_events: mpsc::Receiver<RelayEvent>,
) {
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => handle_request(&mut call, request).await,
                None => {
                    debug!(target: "CallManager", "[{}] all handles dropped", call.call_id());
                    call.destroy().await;
                }
            },
            Some(event) = relay_events.recv() => call.on_relay_event(event).await,
        }
        if call.state().is_destroyed() {
            break;
        }
    }
    requests.close();
    // Answer whatever was queued behind the destroy.
    while let Ok(request) = requests.try_recv() {
        reject(request);
    }
}

async fn handle_request(call: &mut Call, request: CallRequest) {
    match request {
        CallRequest::Join { av, reply } => {
            let _ = reply.send(call.join(av).await);
        }
        CallRequest::Hangup { reply } => {
            let _ = reply.send(call.hangup().await);
        }
        CallRequest::AbortReconnect { reply } => {
            let _ = reply.send(call.abort_reconnect());
        }
        CallRequest::RequestSpeaker { add, reply } => {
            let _ = reply.send(call.request_speaker(add).await);
        }
        CallRequest::ApproveSpeakRequest { cid, allow, reply } => {
            let _ = reply.send(call.approve_speak_request(cid, allow).await);
        }
        CallRequest::StopSpeak { cid, reply } => {
            let _ = reply.send(call.stop_speak(cid).await);
        }
        CallRequest::RequestHighResolution {
            cid,
            quality,
            reply,
        } => {
            let _ = reply.send(call.request_high_resolution_video(cid, quality).await);
        }
        CallRequest::StopHighResolution { cids, reply } => {
            let _ = reply.send(call.stop_high_resolution_video(cids).await);
        }
        CallRequest::RequestLowResolution { cids, reply } => {
            let _ = reply.send(call.request_low_resolution_video(cids).await);
        }
        CallRequest::StopLowResolution { cids, reply } => {
            let _ = reply.send(call.stop_low_resolution_video(cids).await);
        }
        CallRequest::SetHiresQuality {
            cid,
            quality,
            reply,
        } => {
            let _ = reply.send(call.request_hires_quality(cid, quality).await);
        }
        CallRequest::SetLayer {
            spatial,
            temporal,
            screen_temporal,
            reply,
        } => {
            let _ = reply.send(call.set_layer(spatial, temporal, screen_temporal).await);
        }
        CallRequest::UpdateAvFlags { av, reply } => {
            let _ = reply.send(call.update_av_flags(av).await);
        }
        CallRequest::RotateKey { reply } => {
            let _ = reply.send(call.generate_and_send_new_key().await);
        }
        CallRequest::AddParticipant { user, reply } => {
            let _ = reply.send(call.add_participant(user));
        }
        CallRequest::RemoveParticipant { user, reply } => {
            let _ = reply.send(call.remove_participant(&user));
        }
        CallRequest::Snapshot { reply } => {
            let _ = reply.send(call.snapshot());
        }
        CallRequest::Destroy { reply } => {
            call.destroy().await;
            let _ = reply.send(());
        }
    }
}

fn reject(request: CallRequest) {
    match request {
        CallRequest::Join { reply, .. }
        | CallRequest::Hangup { reply }
        | CallRequest::AbortReconnect { reply }
        | CallRequest::RequestSpeaker { reply, .. }
        | CallRequest::ApproveSpeakRequest { reply, .. }
        | CallRequest::StopSpeak { reply, .. }
        | CallRequest::RequestHighResolution { reply, .. }
        | CallRequest::StopHighResolution { reply, .. }
        | CallRequest::RequestLowResolution { reply, .. }
        | CallRequest::StopLowResolution { reply, .. }
        | CallRequest::SetHiresQuality { reply, .. }
        | CallRequest::SetLayer { reply, .. }
        | CallRequest::UpdateAvFlags { reply, .. } => {
            let _ = reply.send(Err(CallError::Closed));
        }
        CallRequest::RotateKey { reply } => {
            let _ = reply.send(Err(CallError::Closed));
        }
        CallRequest::AddParticipant { reply, .. } | CallRequest::RemoveParticipant { reply, .. } => {
            let _ = reply.send(Err(CallError::Closed));
        }
        CallRequest::Snapshot { .. } => {}
        CallRequest::Destroy { reply } => {
            warn!(target: "CallManager", "destroy requested twice");
            let _ = reply.send(());
        }
    }
}
