//! End-to-end tests: a real tonic client against a running fleet.

use prost_reflect::{DynamicMessage, MessageDescriptor};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Code, Status};
use zentinel_grpc_mock::codec::{decode, encode};
use zentinel_grpc_mock::{
    DescriptorSet, DynamicCodec, EndpointSpec, FleetError, FleetSettings, GenericValue,
    MockFleet, MockHarness, Payload,
};

const SAY_HELLO: &str = "/helloworld.Greeter/SayHello";

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn local() -> FleetSettings {
    FleetSettings {
        host: "127.0.0.1".to_string(),
        ..Default::default()
    }
}

fn payload(value: serde_json::Value) -> Payload {
    GenericValue::from(value).into_map().unwrap()
}

fn value(value: serde_json::Value) -> GenericValue {
    GenericValue::from(value)
}

struct Client {
    request: MessageDescriptor,
    reply: MessageDescriptor,
    grpc: tonic::client::Grpc<Channel>,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let descriptors = DescriptorSet::load(&fixtures()).unwrap();
        let pool = descriptors.pool();
        let channel = Channel::from_shared(format!("http://127.0.0.1:{port}"))
            .unwrap()
            .connect()
            .await
            .unwrap();

        Self {
            request: pool.get_message_by_name("helloworld.HelloRequest").unwrap(),
            reply: pool.get_message_by_name("helloworld.HelloReply").unwrap(),
            grpc: tonic::client::Grpc::new(channel),
        }
    }

    async fn call(
        &mut self,
        path: &'static str,
        request: serde_json::Value,
        metadata: &[(&'static str, &'static str)],
    ) -> Result<Payload, Status> {
        let message = encode(&payload(request), &self.request).unwrap();
        let mut request = tonic::Request::new(message);
        for (key, val) in metadata {
            request.metadata_mut().insert(*key, val.parse().unwrap());
        }

        self.grpc.ready().await.unwrap();
        let response: tonic::Response<DynamicMessage> = self
            .grpc
            .unary(
                request,
                PathAndQuery::from_static(path),
                DynamicCodec::new(self.reply.clone()),
            )
            .await?;
        Ok(decode(response.get_ref()))
    }

    async fn say_hello(&mut self, request: serde_json::Value) -> Result<Payload, Status> {
        self.call(SAY_HELLO, request, &[]).await
    }
}

async fn harness_on_one_port() -> (MockHarness, u16) {
    let harness = MockHarness::with_settings(local());
    harness.initialize(fixtures(), &[0]).await.unwrap();
    let port = harness.list_active_ports().await[0];
    (harness, port)
}

#[tokio::test]
async fn exact_rule_answers_and_misses_are_not_found() {
    let (harness, port) = harness_on_one_port().await;
    harness
        .add_rule(
            "helloworld.Greeter",
            "SayHello",
            value(json!({"equals": {"name": "world"}})),
            value(json!({"data": {"message": "hi"}})),
        )
        .await
        .unwrap();

    let mut client = Client::connect(port).await;

    let reply = client.say_hello(json!({"name": "world"})).await.unwrap();
    assert_eq!(reply["message"], GenericValue::from("hi"));

    let status = client.say_hello(json!({"name": "other"})).await.unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert!(status.message().contains("helloworld.Greeter"));
    assert!(status.message().contains("SayHello"));

    harness.shutdown().await;
}

#[tokio::test]
async fn error_rule_fails_call_with_message() {
    let (harness, port) = harness_on_one_port().await;
    harness
        .add_rule(
            "helloworld.Greeter",
            "SayHello",
            value(json!({"matches": {"name": "world"}})),
            value(json!({"error": "boom"})),
        )
        .await
        .unwrap();
    harness
        .add_rule(
            "helloworld.Greeter",
            "SayHello",
            value(json!({"matches": {"name": "guest-.*"}})),
            value(json!({"error": "go away", "code": 7})),
        )
        .await
        .unwrap();

    let mut client = Client::connect(port).await;

    let status = client
        .say_hello(json!({"name": "world", "times": 2}))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message(), "boom");

    let status = client.say_hello(json!({"name": "guest-42"})).await.unwrap_err();
    assert_eq!(status.code(), Code::PermissionDenied);
    assert_eq!(status.message(), "go away");

    harness.shutdown().await;
}

#[tokio::test]
async fn nested_imports_headers_and_templates() {
    let (harness, port) = harness_on_one_port().await;
    harness
        .add_rule(
            "helloworld.Greeter",
            "SayHello",
            value(json!({
                "matches": {"locale": {"language": "fr"}},
                "headers": {"x-tenant": "acme"}
            })),
            value(json!({
                "template": true,
                "data": {"message": "Bonjour {{request.name}}", "tags": ["{{lookup headers \"x-tenant\"}}"]}
            })),
        )
        .await
        .unwrap();

    let mut client = Client::connect(port).await;

    let reply = client
        .call(
            SAY_HELLO,
            json!({"name": "Ada", "locale": {"language": "fr", "region": "CA"}}),
            &[("x-tenant", "acme")],
        )
        .await
        .unwrap();
    assert_eq!(reply["message"], GenericValue::from("Bonjour Ada"));
    assert_eq!(reply["tags"], GenericValue::List(vec!["acme".into()]));

    // Header constraint not met
    let status = client
        .say_hello(json!({"name": "Ada", "locale": {"language": "fr"}}))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    harness.shutdown().await;
}

#[tokio::test]
async fn streaming_and_unknown_methods_are_unimplemented() {
    let (harness, port) = harness_on_one_port().await;
    let mut client = Client::connect(port).await;

    let status = client
        .call("/helloworld.Greeter/SayHelloStream", json!({}), &[])
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let status = client
        .call("/helloworld.Greeter/Missing", json!({}), &[])
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    harness.shutdown().await;
}

#[tokio::test]
async fn startup_failure_leaves_nothing_running() {
    let fleet = MockFleet::new(local());
    let err = fleet
        .start_all(vec![
            EndpointSpec::new("first", 0, fixtures()),
            EndpointSpec::new("second", 0, fixtures().join("does-not-exist")),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Config(_)));
    assert!(fleet.list_ports().await.is_empty());
    assert!(!fleet.is_running().await);
}

#[tokio::test]
async fn stop_all_empties_the_fleet() {
    let fleet = MockFleet::new(local());
    let ports = fleet
        .start_all(vec![
            EndpointSpec::new("a", 0, fixtures()),
            EndpointSpec::new("b", 0, fixtures()),
        ])
        .await
        .unwrap();
    assert!(fleet.is_running().await);

    fleet.stop_all().await;
    assert!(fleet.list_ports().await.is_empty());
    assert!(!fleet.is_running().await);

    // Listeners are released
    for port in ports {
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}

#[tokio::test]
async fn concurrent_rules_reach_every_endpoint() {
    let fleet = Arc::new(MockFleet::new(local()));
    let ports = fleet
        .start_all(vec![
            EndpointSpec::new("a", 0, fixtures()),
            EndpointSpec::new("b", 0, fixtures()),
        ])
        .await
        .unwrap();

    let names = ["alice", "bob", "carol", "dave"];
    let tasks: Vec<_> = names
        .iter()
        .map(|name| {
            let fleet = Arc::clone(&fleet);
            let name = name.to_string();
            tokio::spawn(async move {
                let rule = zentinel_grpc_mock::Rule::from_values(
                    "helloworld.Greeter",
                    "SayHello",
                    value(json!({"equals": {"name": name}})),
                    value(json!({"data": {"message": format!("hi {name}")}})),
                )
                .unwrap();
                fleet.add_rule(rule).await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for port in &ports {
        let mut client = Client::connect(*port).await;
        for name in names {
            let reply = client.say_hello(json!({"name": name})).await.unwrap();
            assert_eq!(reply["message"], GenericValue::from(format!("hi {name}")));
        }
    }

    fleet.stop_all().await;
}
