//! Browser WebSocket implementation using `web_sys::WebSocket`.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use gloo_timers::callback::Timeout;
use url::Url;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use super::{Timer, TimerHandle, Transport, TransportConnection, TransportLink};
use crate::error::TransportError;

/// Transport backed by the browser's `WebSocket`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

type Callbacks = (
    Closure<dyn FnMut(web_sys::Event)>,
    Closure<dyn FnMut(MessageEvent)>,
    Closure<dyn FnMut(CloseEvent)>,
    Closure<dyn FnMut(ErrorEvent)>,
);

impl Transport for WebSocketTransport {
    fn connect(
        &self,
        url: &Url,
        link: TransportLink,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        let ws = WebSocket::new(url.as_str())
            .map_err(|e| TransportError::Connect(format!("{:?}", e)))?;

        let link_open = link.clone();
        let onopen = Closure::wrap(Box::new(move |_: web_sys::Event| {
            link_open.opened();
        }) as Box<dyn FnMut(web_sys::Event)>);
        ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));

        let link_message = link.clone();
        let onmessage = Closure::wrap(Box::new(move |e: MessageEvent| {
            match e.data().as_string() {
                Some(text) => link_message.frame(&text),
                None => crate::log_debug!("Ignoring non-text WebSocket frame"),
            }
        }) as Box<dyn FnMut(MessageEvent)>);
        ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));

        let link_close = link;
        let onclose = Closure::wrap(Box::new(move |e: CloseEvent| {
            let reason = if e.reason().is_empty() {
                format!("code {}", e.code())
            } else {
                e.reason()
            };
            link_close.closed(Some(reason));
        }) as Box<dyn FnMut(CloseEvent)>);
        ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));

        // Browsers always follow an error with a close event
        let onerror = Closure::wrap(Box::new(move |_: ErrorEvent| {
            crate::log_warn!("WebSocket error event");
        }) as Box<dyn FnMut(ErrorEvent)>);
        ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));

        Ok(Box::new(BrowserConnection {
            ws,
            callbacks: Some((onopen, onmessage, onclose, onerror)),
        }))
    }
}

struct BrowserConnection {
    ws: WebSocket,
    callbacks: Option<Callbacks>,
}

impl BrowserConnection {
    fn detach(&self) {
        self.ws.set_onopen(None);
        self.ws.set_onmessage(None);
        self.ws.set_onclose(None);
        self.ws.set_onerror(None);
    }
}

impl TransportConnection for BrowserConnection {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.ws.ready_state() != WebSocket::OPEN {
            return Err(TransportError::Closed);
        }
        self.ws
            .send_with_str(&frame)
            .map_err(|e| TransportError::Send(format!("{:?}", e)))
    }

    fn close(&self) {
        self.detach();
        let _ = self.ws.close();
    }
}

impl Drop for BrowserConnection {
    fn drop(&mut self) {
        self.detach();
        // The connection may be dropped from inside one of its own callbacks;
        // free the closures on the next tick instead.
        if let Some(callbacks) = self.callbacks.take() {
            Timeout::new(0, move || drop(callbacks)).forget();
        }
    }
}

/// Timer backed by `setTimeout`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrowserTimer;

impl Timer for BrowserTimer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        let cancelled_for_task = cancelled.clone();
        let millis = delay.as_millis().min(u32::MAX as u128) as u32;

        Timeout::new(millis, move || {
            if !cancelled_for_task.get() {
                task();
            }
        })
        .forget();

        TimerHandle::new(move || cancelled.set(true))
    }
}
