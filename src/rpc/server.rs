//! Request handlers for inbound queries.

pub mod tokens;

use std::net::SocketAddrV4;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{
    nodes_to_bytes, Arguments, ErrorSpecific, MessageType, RequestSpecific, RoutingTable,
    ERROR_METHOD_UNKNOWN, ERROR_PROTOCOL,
};

pub use tokens::Tokens;

/// Produce the reply to an inbound query, `None` if no reply should be sent.
///
/// Responses don't carry our id yet, it is added when the response is sent.
pub fn handle_request(
    routing_table: &Mutex<RoutingTable>,
    tokens: &Tokens,
    from: SocketAddrV4,
    request: &RequestSpecific,
) -> Option<MessageType> {
    if request.method == "error" {
        trace!(?from, "Ignoring error query");
        return None;
    }

    Some(reply(routing_table, tokens, from, request))
}

fn reply(
    routing_table: &Mutex<RoutingTable>,
    tokens: &Tokens,
    from: SocketAddrV4,
    request: &RequestSpecific,
) -> MessageType {
    let arguments = &request.arguments;

    match request.method.as_str() {
        "ping" => MessageType::Response(Arguments::new()),
        "find_node" => {
            let Some(target) = arguments.get_id("target") else {
                return protocol_error("Missing or invalid target");
            };

            let closest = routing_table.lock().closest(&target);

            MessageType::Response(Arguments::new().with_bytes("nodes", nodes_to_bytes(&closest)))
        }
        "get_peers" => {
            let Some(info_hash) = arguments.get_id("info_hash") else {
                return protocol_error("Missing or invalid info_hash");
            };

            let closest = routing_table.lock().closest(&info_hash);

            MessageType::Response(
                Arguments::new()
                    .with_bytes("token", tokens.generate_token(from).to_vec())
                    .with_bytes("nodes", nodes_to_bytes(&closest)),
            )
        }
        "announce_peer" => {
            let valid_token = arguments
                .get_bytes("token")
                .map(|token| tokens.validate(from, token))
                .unwrap_or(false);

            if !valid_token {
                debug!(
                    ?from,
                    request_type = "announce_peer",
                    "Invalid token"
                );
                return protocol_error("Bad token");
            }

            let Some(info_hash) = arguments.get_id("info_hash") else {
                return protocol_error("Missing or invalid info_hash");
            };

            let implied_port = arguments.get_int("implied_port").unwrap_or(0) != 0;

            let port = match arguments.get_int("port").map(u16::try_from) {
                _ if implied_port => from.port(),
                Some(Ok(port)) => port,
                _ => return protocol_error("Missing or invalid port"),
            };

            debug!(
                ?info_hash,
                peer = ?SocketAddrV4::new(*from.ip(), port),
                request_type = "announce_peer",
                "Accepted announcement"
            );

            MessageType::Response(Arguments::new())
        }
        method => {
            debug!(?from, method, "Unknown method");

            MessageType::Error(ErrorSpecific {
                code: ERROR_METHOD_UNKNOWN,
                description: "Method Unknown".to_string(),
            })
        }
    }
}

fn protocol_error(description: &str) -> MessageType {
    MessageType::Error(ErrorSpecific {
        code: ERROR_PROTOCOL,
        description: description.to_string(),
    })
}

#[cfg(test)]
mod test {
    use crate::common::{bytes_to_nodes, Id};

    use super::*;

    fn request(method: &str, arguments: Arguments) -> RequestSpecific {
        RequestSpecific {
            method: method.to_string(),
            arguments: arguments.with_bytes("id", Id::random().to_vec()),
        }
    }

    fn from() -> SocketAddrV4 {
        "127.0.0.1:6881".parse().unwrap()
    }

    fn error_code(message: Option<MessageType>) -> Option<i64> {
        match message {
            Some(MessageType::Error(error)) => Some(error.code),
            _ => None,
        }
    }

    #[test]
    fn ping() {
        let table = Mutex::new(RoutingTable::new(Id::random()));

        assert_eq!(
            handle_request(&table, &Tokens::new(), from(), &request("ping", Arguments::new())),
            Some(MessageType::Response(Arguments::new()))
        );
    }

    #[test]
    fn find_node_returns_closest() {
        let table = Mutex::new(RoutingTable::new(Id::random()));

        for i in 0..40_u32 {
            table
                .lock()
                .update(Id::random(), SocketAddrV4::new(i.into(), 6881), false);
        }

        let target = Id::random();
        let expected = table.lock().closest(&target);

        let response = handle_request(
            &table,
            &Tokens::new(),
            from(),
            &request("find_node", Arguments::new().with_bytes("target", target.to_vec())),
        );

        let Some(MessageType::Response(result)) = response else {
            panic!("expected a response");
        };

        let nodes = bytes_to_nodes(result.get_bytes("nodes").unwrap()).unwrap();
        let ids: Vec<_> = nodes.iter().map(|n| n.id).collect();
        let expected_ids: Vec<_> = expected.iter().map(|n| n.id).collect();

        assert_eq!(ids, expected_ids);
    }

    #[test]
    fn find_node_without_target() {
        let table = Mutex::new(RoutingTable::new(Id::random()));

        let response = handle_request(
            &table,
            &Tokens::new(),
            from(),
            &request("find_node", Arguments::new().with_bytes("target", vec![1, 2])),
        );

        assert_eq!(error_code(response), Some(ERROR_PROTOCOL));
    }

    #[test]
    fn get_peers_then_announce() {
        let table = Mutex::new(RoutingTable::new(Id::random()));
        let tokens = Tokens::new();
        let info_hash = Id::random();

        let response = handle_request(
            &table,
            &tokens,
            from(),
            &request("get_peers", Arguments::new().with_bytes("info_hash", info_hash.to_vec())),
        );

        let Some(MessageType::Response(result)) = response else {
            panic!("expected a response");
        };
        let token = result.get_bytes("token").unwrap().to_vec();
        assert!(result.get("values").is_none());

        let announce = Arguments::new()
            .with_bytes("info_hash", info_hash.to_vec())
            .with_int("port", 6882)
            .with_bytes("token", token.clone());

        assert_eq!(
            handle_request(&table, &tokens, from(), &request("announce_peer", announce.clone())),
            Some(MessageType::Response(Arguments::new()))
        );

        // Same token presented by another address.
        let other: SocketAddrV4 = "127.0.0.2:6881".parse().unwrap();
        assert_eq!(
            error_code(handle_request(&table, &tokens, other, &request("announce_peer", announce))),
            Some(ERROR_PROTOCOL)
        );
    }

    #[test]
    fn announce_without_token() {
        let table = Mutex::new(RoutingTable::new(Id::random()));

        let announce = Arguments::new()
            .with_bytes("info_hash", Id::random().to_vec())
            .with_int("port", 6882);

        assert_eq!(
            error_code(handle_request(
                &table,
                &Tokens::new(),
                from(),
                &request("announce_peer", announce)
            )),
            Some(ERROR_PROTOCOL)
        );
    }

    #[test]
    fn announce_with_implied_port() {
        let table = Mutex::new(RoutingTable::new(Id::random()));
        let tokens = Tokens::new();

        let announce = Arguments::new()
            .with_bytes("info_hash", Id::random().to_vec())
            .with_int("implied_port", 1)
            .with_bytes("token", tokens.generate_token(from()).to_vec());

        assert_eq!(
            handle_request(&table, &tokens, from(), &request("announce_peer", announce)),
            Some(MessageType::Response(Arguments::new()))
        );
    }

    #[test]
    fn unknown_method() {
        let table = Mutex::new(RoutingTable::new(Id::random()));

        assert_eq!(
            error_code(handle_request(
                &table,
                &Tokens::new(),
                from(),
                &request("vote", Arguments::new())
            )),
            Some(ERROR_METHOD_UNKNOWN)
        );
    }

    #[test]
    fn error_query_gets_no_reply() {
        let table = Mutex::new(RoutingTable::new(Id::random()));

        assert_eq!(
            handle_request(&table, &Tokens::new(), from(), &request("error", Arguments::new())),
            None
        );
    }
}
