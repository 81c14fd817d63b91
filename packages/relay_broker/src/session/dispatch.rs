//! Maps decoded calls onto the broker API and shapes the reply.

use tracing::{debug, error};

use super::protocol::{BrokerCall, CallResult, CallValue};
use crate::broker::{Broker, ClientContext, RelayHandoff};
use crate::error::{BrokerError, ErrorResponse};

/// Reply for the caller plus an optional relay handoff to start after it.
pub struct Dispatched {
    pub result: CallResult,
    pub handoff: Option<RelayHandoff>,
}

pub async fn dispatch_call(broker: &Broker, ctx: &ClientContext, call: BrokerCall) -> Dispatched {
    let method = call.method();
    let outcome: Result<(CallValue, Option<RelayHandoff>), BrokerError> = match call {
        BrokerCall::Version { version } => {
            broker.version(ctx, version).await;
            Ok((CallValue::Unit, None))
        }
        BrokerCall::Register {
            app_id,
            public_id,
            registration_key,
        } => broker
            .register(&app_id, &public_id, &registration_key)
            .map(|secret_key| (CallValue::SecretKey { secret_key }, None)),
        BrokerCall::Authenticate {
            app_id,
            public_id,
            secret_key,
        } => {
            broker
                .authenticate(ctx, app_id, public_id, &secret_key)
                .await;
            Ok((CallValue::Unit, None))
        }
        BrokerCall::ConnectTo {
            public_id,
            correlation_id,
        } => broker
            .connect_to(ctx, &public_id, correlation_id)
            .await
            .map(|()| (CallValue::Unit, None)),
        BrokerCall::AcceptConnection { token } => broker
            .accept_connection(ctx, token)
            .await
            .map(|handoff| (CallValue::Unit, handoff)),
        BrokerCall::RejectConnection { token } => broker
            .reject_connection(ctx, token)
            .await
            .map(|()| (CallValue::Unit, None)),
    };

    match outcome {
        Ok((value, handoff)) => Dispatched {
            result: CallResult::Ok { value },
            handoff,
        },
        Err(e) => {
            if e.is_internal() {
                error!(conn_id = %ctx.id(), method, error = %e, "call failed");
            } else {
                debug!(conn_id = %ctx.id(), method, code = e.error_code(), "call refused");
            }
            Dispatched {
                result: CallResult::Error(ErrorResponse::from(&e)),
                handoff: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use uuid::Uuid;

    use crate::config::BrokerConfig;
    use crate::metrics::BrokerMetrics;
    use crate::session::remote::RemoteHandle;
    use crate::token::{TOKEN_LEN, Token};

    fn setup() -> (Broker, ClientContext) {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(BrokerMetrics::new()));
        let (remote, _outlet) = RemoteHandle::channel(Uuid::new_v4(), 4);
        (broker, ClientContext::new(remote, "test", None))
    }

    #[tokio::test]
    async fn register_returns_secret_key() {
        let (broker, ctx) = setup();
        let call = BrokerCall::Register {
            app_id: b"app".to_vec(),
            public_id: b"alice".to_vec(),
            registration_key: vec![],
        };
        let dispatched = dispatch_call(&broker, &ctx, call).await;
        assert!(matches!(
            dispatched.result,
            CallResult::Ok {
                value: CallValue::SecretKey { .. }
            }
        ));
        assert!(dispatched.handoff.is_none());
    }

    #[tokio::test]
    async fn authenticate_then_version_are_unit() {
        let (broker, ctx) = setup();
        for call in [
            BrokerCall::Version { version: 1 },
            BrokerCall::Authenticate {
                app_id: b"app".to_vec(),
                public_id: b"alice".to_vec(),
                secret_key: vec![0; TOKEN_LEN],
            },
        ] {
            let dispatched = dispatch_call(&broker, &ctx, call).await;
            assert_eq!(
                dispatched.result,
                CallResult::Ok {
                    value: CallValue::Unit
                }
            );
        }
        assert!(ctx.is_authenticated().await);
    }

    #[tokio::test]
    async fn errors_carry_code_and_message() {
        let (broker, ctx) = setup();
        let call = BrokerCall::AcceptConnection {
            token: Token::from_bytes([9; TOKEN_LEN]),
        };
        let dispatched = dispatch_call(&broker, &ctx, call).await;
        assert_eq!(
            dispatched.result,
            CallResult::Error(ErrorResponse {
                code: "unknown_connection".into(),
                message: "unknown connection".into(),
            })
        );
    }

    #[tokio::test]
    async fn connect_before_authenticate_is_refused() {
        let (broker, ctx) = setup();
        let call = BrokerCall::ConnectTo {
            public_id: b"bob".to_vec(),
            correlation_id: 1,
        };
        match dispatch_call(&broker, &ctx, call).await.result {
            CallResult::Error(e) => {
                assert_eq!(e.code, "not_authenticated");
                assert_eq!(e.message, "must be authenticated to connect to other user");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
