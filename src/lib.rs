// lib.rs
// Installment billing core: models plus the state layer (ledger, settings,
// generation, delinquency, settlement).

pub mod models;
pub mod state;
