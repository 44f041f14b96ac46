use std::{net::SocketAddr, sync::Arc};

use crate::state::State;
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use tracing::Instrument as _;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("serde json error: `{0}`")]
    SerdeJson(#[from] serde_json::Error),

    #[error("hyper http error: `{0}`")]
    HyperHttp(#[from] hyper::http::Error),

    #[error("hyper error: `{0}`")]
    Hyper(#[from] hyper::Error),

    #[error("std io error: `{0}`")]
    Io(#[from] std::io::Error),

    #[error("anyhow error: `{0}`")]
    Anyhow(#[from] anyhow::Error),

    #[error("db error: `{0}`")]
    Sqlx(#[from] db::Error),

    #[error("Not found")]
    NotFound,
}

impl Error {
    #[must_use]
    pub const fn get_status(&self) -> hyper::StatusCode {
        match *self {
            Self::SerdeJson(_)
            | Self::HyperHttp(_)
            | Self::Hyper(_)
            | Self::Io(_)
            | Self::Anyhow(_)
            | Self::Sqlx(_) => hyper::StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound => hyper::StatusCode::NOT_FOUND,
        }
    }

    #[must_use]
    pub fn get_body(&self) -> crate::io::Error {
        crate::io::Error {
            error: self.to_string(),
        }
    }
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn construct_json_response<U: serde::Serialize>(
    status: hyper::StatusCode,
    data: &U,
) -> Result<hyper::Response<BoxBody<Bytes, hyper::Error>>, Error> {
    Ok(hyper::Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full(serde_json::to_string(data)?))?)
}

type Response = hyper::Response<BoxBody<Bytes, hyper::Error>>;

fn construct_json_ok_response<U: serde::Serialize>(data: &U) -> Result<Response, Error> {
    construct_json_response(hyper::StatusCode::OK, data)
}

pub struct Server {}
impl Server {
    pub async fn run(addr: SocketAddr, state: Arc<State>) -> Result<(), Error> {
        async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            let server_span = tracing::span!(tracing::Level::TRACE, "http_server", %addr);

            loop {
                let (stream, _) = listener.accept().await?;
                let io = hyper_util::rt::TokioIo::new(stream);

                let state = state.clone();
                tokio::task::spawn({
                    let server_span = server_span.clone();
                    async move {
                        if let Err(err) = hyper::server::conn::http1::Builder::new()
                            .serve_connection(
                                io,
                                hyper::service::service_fn(move |req| router(req, state.clone())),
                            )
                            .instrument(server_span.clone())
                            .await
                        {
                            tracing::error!("Error serving connection: {err:?}");
                        }
                    }
                });
            }
        }
        .await
    }
}

async fn router(
    req: hyper::Request<hyper::body::Incoming>,
    state: Arc<State>,
) -> Result<Response, Error> {
    let span = tracing::span!(
        tracing::Level::INFO,
        "request",
        method = ?req.method(),
        uri = ?req.uri(),
    );
    async move {
        let r = match (req.method(), req.uri().path()) {
            (&hyper::Method::GET, "/status" | "/status/") => handler::status::get(&state),
            (&hyper::Method::GET, "/status/machines" | "/status/machines/") => {
                handler::status::machines(&state)
            }
            (&hyper::Method::GET, "/status/jobsets" | "/status/jobsets/") => {
                handler::status::jobsets(&state)
            }
            (&hyper::Method::GET, "/status/builds" | "/status/builds/") => {
                handler::status::builds(&state)
            }
            (&hyper::Method::GET, "/status/steps" | "/status/steps/") => {
                handler::status::steps(&state)
            }
            (&hyper::Method::GET, "/status/runnable" | "/status/runnable/") => {
                handler::status::runnable(&state)
            }
            (&hyper::Method::POST, "/dump_status" | "/dump_status/") => {
                handler::dump_status::post(&state).await
            }
            (&hyper::Method::GET, "/metrics" | "/metrics/") => handler::metrics::get(&state),
            _ => Err(Error::NotFound),
        };
        if let Err(r) = r.as_ref() {
            construct_json_response(r.get_status(), &r.get_body())
        } else {
            r
        }
    }
    .instrument(span)
    .await
}

mod handler {
    pub mod status {
        use super::super::{Error, Response, construct_json_ok_response};
        use crate::{io, state::State};

        #[tracing::instrument(skip(state), err)]
        pub fn get(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            construct_json_ok_response(&io::DumpResponse::new(state))
        }

        #[tracing::instrument(skip(state), err)]
        pub fn machines(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            let machines = state
                .machines
                .get_all_machines()
                .into_iter()
                .map(|m| (m.ssh_name.clone(), io::Machine::from(&m)))
                .collect();
            construct_json_ok_response(&io::MachinesResponse::new(machines))
        }

        #[tracing::instrument(skip(state), err)]
        pub fn jobsets(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            let jobsets = state.jobsets.clone_as_io();
            construct_json_ok_response(&io::JobsetsResponse::new(jobsets))
        }

        #[tracing::instrument(skip(state), err)]
        pub fn builds(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            let builds = state.builds.clone_as_io();
            construct_json_ok_response(&io::BuildsResponse::new(builds))
        }

        #[tracing::instrument(skip(state), err)]
        pub fn steps(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            let steps = state.steps.clone_as_io();
            construct_json_ok_response(&io::StepsResponse::new(steps))
        }

        #[tracing::instrument(skip(state), err)]
        pub fn runnable(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            let steps = state
                .runnable
                .snapshot()
                .into_iter()
                .map(Into::into)
                .collect();
            construct_json_ok_response(&io::StepsResponse::new(steps))
        }
    }

    pub mod dump_status {
        use super::super::{Error, Response, construct_json_ok_response};
        use crate::{io, state::State};

        #[tracing::instrument(skip(state), err)]
        pub async fn post(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            let mut db = state.db.get().await?;
            let mut tx = db.begin_transaction().await?;
            tx.notify_dump_status().await?;
            tx.commit().await?;
            construct_json_ok_response(&io::Empty {})
        }
    }

    pub mod metrics {
        use super::super::{Error, Response, full};
        use crate::state::State;

        #[tracing::instrument(skip(state), err)]
        pub fn get(state: &std::sync::Arc<State>) -> Result<Response, Error> {
            let metrics = state.metrics.gather_metrics(state)?;
            Ok(hyper::Response::builder()
                .status(hyper::StatusCode::OK)
                .header(
                    hyper::header::CONTENT_TYPE,
                    "text/plain; version=0.0.4; charset=utf-8",
                )
                .body(full(metrics))?)
        }
    }
}
