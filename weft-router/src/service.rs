//! The `router` service contract: thin glue mapping router operations onto
//! the call-engine verbs.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::debug;
use uuid::Uuid;

use weft::codec::JsonCodec;
use weft::server::ServiceContract;
use weft::{BoxStream, Request, Response, Status, Streaming};

use crate::core::{RouterCore, SINK_BUFFER};
use crate::message::{
    now_ms, Ack, ClientTimestamp, ClientsList, Empty, GetOnlineClientsRequest, PongResponse,
    RegisterRequest, RegisterResponse, RouterEvent, RouterMessage, UpdateMetadataRequest,
};

/// Name the router service is registered under.
pub const SERVICE_NAME: &str = "router";

/// Build the `router` service contract over a shared [`RouterCore`].
///
/// One contract is typically instantiated per accepted connection, all of
/// them sharing the same core.
pub fn router_contract(core: Arc<RouterCore>) -> ServiceContract {
    ServiceContract::new(SERVICE_NAME)
        .unary::<JsonCodec<RegisterResponse, RegisterRequest>, _, _>("register", {
            let core = core.clone();
            move |request: Request<RegisterRequest>| {
                let core = core.clone();
                async move {
                    let request = request.into_inner();
                    let client_id = Uuid::new_v4().to_string();
                    // record first, sink attached later by the p2p stream
                    core.register_client(
                        &client_id,
                        None,
                        request.client_name,
                        request.groups,
                        request.metadata,
                    );
                    Ok(Response::new(RegisterResponse {
                        client_id,
                        success: true,
                        error_message: None,
                    }))
                }
            }
        })
        .unary::<JsonCodec<PongResponse, ClientTimestamp>, _, _>("ping", {
            move |request: Request<ClientTimestamp>| async move {
                Ok(Response::new(PongResponse {
                    client_ts: request.into_inner().client_ts,
                    server_ts: now_ms(),
                }))
            }
        })
        .unary::<JsonCodec<ClientsList, GetOnlineClientsRequest>, _, _>("get_online_clients", {
            let core = core.clone();
            move |request: Request<GetOnlineClientsRequest>| {
                let core = core.clone();
                async move {
                    let clients = core.online_clients(request.get_ref());
                    Ok(Response::new(ClientsList { clients }))
                }
            }
        })
        .unary::<JsonCodec<Ack, UpdateMetadataRequest>, _, _>("update_client_metadata", {
            let core = core.clone();
            move |request: Request<UpdateMetadataRequest>| {
                let core = core.clone();
                async move {
                    let request = request.into_inner();
                    core.update_client_metadata(
                        &request.client_id,
                        request.metadata,
                        request.groups,
                    )?;
                    Ok(Response::new(Ack {
                        success: true,
                        error_message: None,
                    }))
                }
            }
        })
        .streaming::<JsonCodec<RouterMessage, RouterMessage>, _, _, _>("p2p", {
            let core = core.clone();
            move |request: Request<Streaming<RouterMessage>>| {
                let core = core.clone();
                async move { p2p(core, request.into_inner()).await }
            }
        })
        .server_streaming::<JsonCodec<RouterEvent, Empty>, _, _, _>("events", {
            move |_request: Request<Empty>| {
                let core = core.clone();
                async move {
                    let mut subscription = core.subscribe_to_events(None);
                    let stream = async_stream::stream! {
                        while let Some(event) = subscription.recv().await {
                            yield Ok(event);
                        }
                    };
                    Ok(Response::new(Box::pin(stream) as BoxStream<RouterEvent>))
                }
            }
        })
}

// The long-lived bidirectional stream carrying a client's router traffic.
//
// The first inbound message must carry the registered sender id; on success
// the client's placeholder sink is replaced by this stream's outbound side,
// the attach is acknowledged with `heartbeat{connected:true}`, and every
// further inbound message is handed to the core. When the stream ends the
// sink is detached but the record survives, permitting reconnect.
async fn p2p(
    core: Arc<RouterCore>,
    mut inbound: Streaming<RouterMessage>,
) -> Result<Response<BoxStream<RouterMessage>>, Status> {
    let (sink, outbound) = mpsc::channel::<RouterMessage>(SINK_BUFFER);

    let first = inbound.message().await?;
    let sender_id = first.and_then(|message| message.sender_id);

    match sender_id {
        Some(client_id) if core.is_client_online(&client_id) => {
            core.replace_client_stream(&client_id, sink.clone())?;
            let _ = sink.send(RouterMessage::heartbeat_ack()).await;

            // weak, so the registry's clone is the only thing keeping the
            // response stream open once this handler returns
            let probe = sink.downgrade();
            tokio::spawn(async move {
                loop {
                    match inbound.message().await {
                        Ok(Some(message)) => {
                            if !core.is_client_online(&client_id) {
                                // disconnected by the monitor; end the stream
                                break;
                            }
                            core.route(&client_id, message).await;
                        }
                        Ok(None) => break,
                        Err(status) => {
                            debug!(%client_id, "p2p stream failed: {}", status);
                            break;
                        }
                    }
                }
                // detach only if a reconnect has not already replaced us
                core.detach_client_stream(&client_id, &probe);
            });
        }
        _ => {
            let _ = sink
                .send(RouterMessage::error(
                    "first p2p message must carry a registered sender_id",
                ))
                .await;
            // dropping the sink ends the stream after the error is read
        }
    }

    let responses = ReceiverStream::new(outbound).map(Ok::<RouterMessage, Status>);
    Ok(Response::new(Box::pin(responses) as BoxStream<RouterMessage>))
}
