use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::StreamExt;

use weft::codec::JsonCodec;
use weft::server::{Responder, ServiceContract};
use weft::transport::ws::WsTransport;
use weft::{BoxStream, Caller, Request, Response, Status};

fn echo_contract() -> ServiceContract {
    ServiceContract::new("Echo")
        .unary::<JsonCodec<String, String>, _, _>("echo", |request: Request<String>| async move {
            Ok(Response::new(request.into_inner()))
        })
        .server_streaming::<JsonCodec<u32, u32>, _, _, _>(
            "count",
            |request: Request<u32>| async move {
                let n = request.into_inner();
                let stream = tokio_stream::iter((1..=n).map(Ok::<u32, Status>));
                Ok(Response::new(Box::pin(stream) as BoxStream<u32>))
            },
        )
}

async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let transport = WsTransport::accept_io(socket).await.unwrap();
                Responder::new(Arc::new(transport))
                    .add_service(echo_contract())
                    .unwrap()
                    .serve()
                    .await;
            });
        }
    });

    format!("ws://{addr}")
}

#[tokio::test]
async fn unary_echo_over_websocket() {
    let url = start_server().await;

    let transport = WsTransport::connect(&url).await.unwrap();
    let caller = Caller::new(Arc::new(transport));

    let reply = caller
        .unary::<JsonCodec<String, String>>(("Echo", "echo"), Request::new("over ws".to_string()))
        .await
        .unwrap();
    assert_eq!(reply.into_inner(), "over ws");
}

#[tokio::test]
async fn many_streams_share_one_socket() {
    let url = start_server().await;

    let transport = WsTransport::connect(&url).await.unwrap();
    let caller = Caller::new(Arc::new(transport));

    let counting = caller
        .server_streaming::<JsonCodec<u32, u32>>(("Echo", "count"), Request::new(3))
        .await
        .unwrap();

    // a second call proceeds while the first stream is still open
    let reply = caller
        .unary::<JsonCodec<String, String>>(("Echo", "echo"), Request::new("interleaved".into()))
        .await
        .unwrap();
    assert_eq!(reply.into_inner(), "interleaved");

    let values: Vec<u32> = counting
        .into_inner()
        .collect::<Result<Vec<_>, Status>>()
        .await
        .unwrap();
    assert_eq!(values, [1, 2, 3]);
}
