use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};

use crate::download::{PipelineError, StepRequest};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TileFetchOperation {
    FetchStep(StepRequest),
}

impl Operation for TileFetchOperation {
    type Output = Result<(), PipelineError>;
}

/// Fetches one step of a region download in the shell.
#[derive(Clone)]
pub struct TileFetch<Ev> {
    context: CapabilityContext<TileFetchOperation, Ev>,
}

impl<Ev> Capability<Ev> for TileFetch<Ev> {
    type Operation = TileFetchOperation;
    type MappedSelf<MappedEv> = TileFetch<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        TileFetch::new(self.context.map_event(f))
    }
}

impl<Ev> TileFetch<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<TileFetchOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn fetch_step<F>(&self, request: StepRequest, make_event: F)
    where
        F: FnOnce(Result<(), PipelineError>) -> Ev + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let output = context
                .request_from_shell(TileFetchOperation::FetchStep(request))
                .await;
            context.update_app(make_event(output));
        });
    }
}
