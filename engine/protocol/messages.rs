use crate::handler::{ExecuteOptions, QueryResult, RequestHandler, SessionId};
use serde::{Deserialize, Serialize};

/// A call on the request processor, identical for both wire encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Connect {
        user: String,
        password: String,
        database: String,
    },
    Disconnect {
        session: SessionId,
    },
    SqlExecute {
        session: SessionId,
        query: String,
        #[serde(default)]
        options: ExecuteOptions,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Session(SessionId),
    Ok,
    QueryResult(QueryResult),
    Error { message: String },
}

impl Response {
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

pub fn dispatch(handler: &dyn RequestHandler, request: Request) -> Response {
    let result = match request {
        Request::Connect {
            user,
            password,
            database,
        } => handler
            .connect(&user, &password, &database)
            .map(Response::Session),
        Request::Disconnect { session } => handler.disconnect(&session).map(|()| Response::Ok),
        Request::SqlExecute {
            session,
            query,
            options,
        } => handler
            .sql_execute(&session, &query, &options)
            .map(Response::QueryResult),
    };

    result.unwrap_or_else(|e| Response::error(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_shape_is_snake_case() {
        let request = Request::Connect {
            user: "alice".to_string(),
            password: String::new(),
            database: "mydb".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["connect"]["user"], "alice");

        let execute: Request =
            serde_json::from_str(r#"{"sql_execute": {"session": "abc", "query": "SELECT 1;"}}"#)
                .unwrap();
        match execute {
            Request::SqlExecute { session, options, .. } => {
                assert_eq!(session.as_str(), "abc");
                assert_eq!(options, ExecuteOptions::default());
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn bincode_carries_session_responses() {
        let response = Response::Session(SessionId::new("0123"));
        let bytes = bincode::serialize(&response).unwrap();
        let decoded: Response = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, response);
    }
}
