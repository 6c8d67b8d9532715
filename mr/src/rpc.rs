use super::coordinator::RunStatus;
use super::error::ErrorReport;

#[tarpc::service]
pub trait Rpc {
    /// Validates a JSON job payload and starts a run, returning its id.
    async fn start_job(payload: String) -> Result<String, ErrorReport>;
    async fn status(run_id: String) -> Option<RunStatus>;
    async fn cancel(run_id: String) -> bool;
}
