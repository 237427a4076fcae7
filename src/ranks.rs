use crate::error::{Error, Result};
use crate::message::LocalCommunicator;
use core_affinity::{get_core_ids, set_for_current};
use log::error;
use std::thread;

/// Run a closure once per rank, each on its own OS thread, with the ranks
/// connected by a group of `LocalCommunicator`s. If `pin` is set, rank `r`
/// is pinned to core `r` modulo the number of cores. If the system reports
/// no cores, the threads are left unpinned.
///
/// A rank that fails tells its peers to abort, so that nobody waits forever
/// on a message it will never send. The returned error is the first failure
/// that is not one of those secondary aborts.
///
pub fn launch<F, R>(num_ranks: usize, pin: bool, f: F) -> Result<Vec<R>>
where
    F: Fn(&LocalCommunicator) -> Result<R> + Sync,
    R: Send,
{
    let cores = if pin { get_core_ids().unwrap_or_default() } else { Vec::new() };
    let f = &f;

    let results: Vec<Result<R>> = thread::scope(|scope| {
        let handles: Vec<_> = LocalCommunicator::group(num_ranks)
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let core_id = cores.get(rank % cores.len().max(1)).cloned();

                thread::Builder::new()
                    .name(format!("rank-{}", rank))
                    .spawn_scoped(scope, move || {
                        if let Some(core_id) = core_id {
                            set_for_current(core_id);
                        }
                        let result = f(&comm);

                        if let Err(e) = &result {
                            error!("rank {} failed: {}", rank, e);
                            comm.abort();
                        }
                        result
                    })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| match handle {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::Communication(format!("rank {} panicked", rank)))),
                Err(e) => Err(Error::Communication(format!("rank {} could not be started: {}", rank, e))),
            })
            .collect()
    });

    let mut values = Vec::with_capacity(num_ranks);
    let mut failure: Option<Error> = None;

    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => match failure {
                Some(Error::Communication(_)) if !matches!(e, Error::Communication(_)) => failure = Some(e),
                None => failure = Some(e),
                Some(_) => {}
            },
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(values),
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::launch;
    use crate::error::Error;
    use crate::message::Communicator;

    #[test]
    fn every_rank_runs_once() {
        let ranks = launch(5, false, |comm| Ok(comm.rank())).unwrap();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn a_failing_rank_releases_its_peers() {
        let result: Result<Vec<()>, _> = launch(3, true, |comm| {
            if comm.rank() == 1 {
                return Err(Error::Config("rank 1 gives up".to_string()));
            }
            comm.recv(comm.next_tag()).map(|_| ())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
