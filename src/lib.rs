//! Zentinel gRPC Mock
//!
//! An embeddable gRPC mock server. Services are loaded at runtime from
//! `.proto` files and every call is answered from rules registered by the
//! test, with no generated code.
//!
//! # Features
//!
//! - **Dynamic Services**: Compile `.proto` directories at startup and serve every method
//! - **Exact and Partial Matching**: `equals` on the whole request, `matches` with regex strings
//! - **Header Constraints**: Require call metadata values
//! - **Error Responses**: Fail calls with any gRPC status code
//! - **Dynamic Templates**: Use Handlebars templates for dynamic responses
//! - **Latency Simulation**: Delay responses per rule
//! - **Fleets**: Run several ports at once, started and stopped as a unit
//!
//! # Example Configuration
//!
//! ```yaml
//! descriptors: ./protos
//! endpoints:
//!   - port: 50051
//! rules:
//!   - service: helloworld.Greeter
//!     method: SayHello
//!     input:
//!       equals:
//!         name: world
//!     output:
//!       data:
//!         message: "Hello, World!"
//! ```

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod fleet;
pub mod harness;
pub mod matcher;
pub mod rule;
pub mod template;
pub mod value;

pub use codec::DynamicCodec;
pub use config::MockServerConfig;
pub use descriptor::{DescriptorResolver, DescriptorSet, MethodShape};
pub use endpoint::{Lifecycle, MockEndpoint};
pub use error::{
    CodecError, ConfigError, DescriptorError, DispatchError, EndpointError, FleetError,
    HarnessError, MatchError, RuleError,
};
pub use fleet::{EndpointSpec, FleetSettings, MockFleet};
pub use harness::MockHarness;
pub use matcher::{Matcher, StubStore};
pub use rule::{Query, Rule, RuleInput, RuleOutput};
pub use value::{GenericValue, Payload};
