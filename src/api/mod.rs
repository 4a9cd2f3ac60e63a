// =============================================================================
// Operational HTTP surface
// =============================================================================
//
// A worker exposes two read-only endpoints: a public health probe and the
// full operational snapshot. The `health` CLI command queries the former.

pub mod rest;
