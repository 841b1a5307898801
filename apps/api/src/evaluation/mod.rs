// HTTP surface of the evaluator: upload, evaluate, result polling and
// failed-set inspection. Quotas are applied in `routes`, before these run.

pub mod handlers;
pub mod upload;
