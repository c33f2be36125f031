/// Clients for external data sources feeding the pipeline.
///
/// Submodules:
/// - `forecast`: the ML forecasting service that supplies future predictions.

pub mod forecast;
