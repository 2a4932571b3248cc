//! Extraction profiles: the declarative description of how to turn a family
//! of source files into tables.

mod jsonpath;
mod schema;
mod store;

pub use jsonpath::JsonPath;
pub use schema::{
    AggregationDef, DatasourceConfig, Governance, OutputDef, OutputJoin, PopulationStrategy, Profile,
    ReducerDef, TableDef, PROFILE_ID_LENGTH,
};
pub use store::{ProfileStore, PublishedProfile, SampleMatch, TableMatch};

#[cfg(test)]
pub(crate) use schema::tests::sample_profile;
