//! # mf-core — The MONGOFRAME Engine
//!
//! Turns a declarative query model into a MongoDB aggregation pipeline and
//! the resulting documents into typed, label-partitioned data frames.
//!
//! The flow for one query:
//!
//! 1. [`model::QueryModel`] is parsed and validated, then compiled into a
//!    pipeline ([`model::pipeline`]), translating native date layouts with
//!    [`datefmt`].
//! 2. A [`store::Connector`] opens a cursor over the results.
//! 3. The value schema is declared or inferred ([`schema`]).
//! 4. Each document is converted ([`convert`]) and routed into the frame
//!    for its labels ID ([`parser`], [`frame`]).
//!
//! [`executor`] drives all of it; the host surface lives in `mf-hub`.

pub mod convert;
pub mod datefmt;
pub mod error;
pub mod executor;
pub mod frame;
pub mod model;
pub mod panic_guard;
pub mod parser;
pub mod request;
pub mod schema;
pub mod settings;
pub mod store;
pub mod template;

pub use error::QueryError;
pub use executor::{execute_query, query_data, QueryOptions};
pub use frame::{Cell, Field, FieldType, Frame, Labels};
pub use model::{QueryModel, QueryType, ResolvedQueryModel};
pub use request::{DataQuery, DataResponse, QueryDataRequest, QueryDataResponse, TimeRange};
pub use settings::DataSourceSettings;

pub use tokio_util::sync::CancellationToken;
