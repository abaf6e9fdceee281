use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::StreamExt;

use weft::codec::JsonCodec;
use weft::server::{Responder, ServiceContract};
use weft::transport::http2::Http2Transport;
use weft::{BoxStream, Caller, Code, Request, Response, Status, Streaming};

fn calc_contract() -> ServiceContract {
    ServiceContract::new("Calc")
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
        .client_streaming::<JsonCodec<u64, u64>, _, _>(
            "sum",
            |request: Request<Streaming<u64>>| async move {
                let mut inbound = request.into_inner();
                let mut sum = 0;
                while let Some(value) = inbound.message().await? {
                    sum += value;
                }
                Ok(Response::new(sum))
            },
        )
}

async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let transport = Http2Transport::serve(socket).await.unwrap();
                Responder::new(Arc::new(transport))
                    .add_service(calc_contract())
                    .unwrap()
                    .serve()
                    .await;
            });
        }
    });

    addr.to_string()
}

#[tokio::test]
async fn unary_echo_over_http2() {
    let addr = start_server().await;

    let transport = Http2Transport::connect(&addr).await.unwrap();
    let caller = Caller::new(Arc::new(transport));

    let reply = caller
        .unary::<JsonCodec<String, String>>(("Calc", "echo"), Request::new("over h2".to_string()))
        .await
        .unwrap();
    assert_eq!(reply.into_inner(), "over h2");
}

#[tokio::test]
async fn server_streaming_over_http2() {
    let addr = start_server().await;

    let transport = Http2Transport::connect(&addr).await.unwrap();
    let caller = Caller::new(Arc::new(transport));

    let response = caller
        .server_streaming::<JsonCodec<u32, u32>>(("Calc", "count"), Request::new(4))
        .await
        .unwrap();
    let values: Vec<u32> = response
        .into_inner()
        .collect::<Result<Vec<_>, Status>>()
        .await
        .unwrap();
    assert_eq!(values, [1, 2, 3, 4]);
}

#[tokio::test]
async fn client_streaming_over_http2() {
    let addr = start_server().await;

    let transport = Http2Transport::connect(&addr).await.unwrap();
    let caller = Caller::new(Arc::new(transport));

    let requests = tokio_stream::iter([5u64, 10, 15]);
    let reply = caller
        .client_streaming::<JsonCodec<u64, u64>, _>(("Calc", "sum"), Request::new(requests))
        .await
        .unwrap();
    assert_eq!(reply.into_inner(), 30);
}

#[tokio::test]
async fn unknown_method_over_http2_is_unimplemented() {
    let addr = start_server().await;

    let transport = Http2Transport::connect(&addr).await.unwrap();
    let caller = Caller::new(Arc::new(transport));

    let err = caller
        .unary::<JsonCodec<String, String>>(("Calc", "nope"), Request::new("x".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unimplemented);
}
