//! Processor Tasks - transport event and work queue processing
//!
//! The session is driven by two loops sharing one [`UnicastClient`]:
//!
//! * **Transport Event Processor**: drains the inbound queue filled by
//!   [`UnicastClient::notify`] and applies each event as a state transition
//! * **Work Processor**: runs group retry and rebuild work one item at a time,
//!   in submission order, so transport callbacks never wait on a group build
//!
//! # Usage
//!
//! ```rust,ignore
//! use cisbird::{UnicastClient, UnicastOptions, processor};
//!
//! #[embassy_executor::task]
//! async fn unicast_task(client: &'static UnicastClient<MyTransport>) {
//!     processor::run(client).await;
//! }
//!
//! // The transport's callbacks only enqueue
//! fn on_stream_started(client: &UnicastClient<MyTransport>, stream: StreamRef) {
//!     client.notify(TransportEvent::Started { stream }).ok();
//! }
//! ```

use crate::{UnicastClient, UnicastTransport};
use embassy_futures::select::{Either, select};

async fn transport_event_processor<T: UnicastTransport>(client: &UnicastClient<T>) -> ! {
    loop {
        let event = client.next_transport_event().await;
        if let Err(e) = client.handle_transport_event(event).await {
            error!("[PROCESSOR] Transport event {:?} failed: {:?}", event, e);
        }
    }
}

async fn work_processor<T: UnicastTransport>(client: &UnicastClient<T>) -> ! {
    loop {
        let item = client.next_work_item().await;
        if let Err(e) = client.process_work(item).await {
            error!("[PROCESSOR] Work item {:?} failed: {:?}", item, e);
        }
    }
}

/// Run the session processor tasks; never returns
pub async fn run<T: UnicastTransport>(client: &UnicastClient<T>) -> ! {
    info!("[PROCESSOR] Unicast session processor started");
    match select(transport_event_processor(client), work_processor(client)).await {
        Either::First(never) | Either::Second(never) => never,
    }
}
