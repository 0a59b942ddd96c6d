//! Collective communication over an explicit participant list.
//!
//! All collectives run directly on the point-to-point transport using a
//! hypercube schedule: reduce towards the process at position 0 of the `ids`
//! slice in ceil(log2 np) rounds, then broadcast the result back down in as
//! many rounds. No participant ever blocks on a partner that is blocked on
//! it, for any `np`.

use crate::error::{Result, SkeletonError};
use crate::serialize::Payload;
use crate::transport::{Endpoint, ProcessId, Tag};

/// ceil(log2(np)); zero for np <= 1.
fn rounds_for(np: usize) -> u32 {
    if np <= 1 {
        0
    } else {
        usize::BITS - (np - 1).leading_zeros()
    }
}

fn position_of(endpoint: &Endpoint, ids: &[ProcessId], id: ProcessId) -> Result<usize> {
    ids.iter()
        .position(|&p| p == id)
        .ok_or(SkeletonError::UndefinedPeer {
            process: endpoint.id(),
            peer: id,
        })
}

/// Broadcasts `buf` from `root` to every process in `ids`. On return every
/// participant holds the root's data.
pub fn broadcast<T: Payload>(
    endpoint: &Endpoint,
    ids: &[ProcessId],
    root: ProcessId,
    buf: &mut [T],
) -> Result<()> {
    let np = ids.len();
    if np <= 1 {
        return Ok(());
    }

    // The root logically moves to position 0; the displaced id takes the
    // root's former slot.
    let mut order = ids.to_vec();
    let root_at = position_of(endpoint, &order, root)?;
    order.swap(0, root_at);

    let pos = position_of(endpoint, &order, endpoint.id())?;

    for round in 0..rounds_for(np) {
        let step = 1usize << round;

        if pos < step {
            if pos + step < np {
                endpoint.send_slice(order[pos + step], buf, Tag::Broadcast)?;
            }
        } else if pos < 2 * step {
            endpoint.receive_into(order[pos - step], Tag::Broadcast, buf)?;
        }
    }

    Ok(())
}

/// Gathers `send` from every participant into `recv` on every participant.
/// `recv` must hold `ids.len() * send.len()` elements; after completion,
/// block k of the result is the contribution of participant `ids[k]` - the
/// result is ordered by the `ids` slice, not by process id.
pub fn allgather<T: Payload + Clone>(
    endpoint: &Endpoint,
    ids: &[ProcessId],
    send: &[T],
    recv: &mut [T],
) -> Result<()> {
    let np = ids.len();
    let count = send.len();
    debug_assert_eq!(recv.len(), np * count);

    recv[..count].clone_from_slice(send);
    if np <= 1 {
        return Ok(());
    }

    let pos = position_of(endpoint, ids, endpoint.id())?;

    // Phase A: fold towards position 0. At round i, a process at an odd
    // multiple of 2^i ships everything it has gathered so far one hop down.
    for round in 0..rounds_for(np) {
        let step = 1usize << round;
        let group = step << 1;

        if pos >= step && (pos - step) % group == 0 {
            let held = step.min(np - pos) * count;
            endpoint.send_slice(ids[pos - step], &recv[..held], Tag::Allgather)?;
        } else if pos % group == 0 && pos + step < np {
            let incoming = step.min(np - (pos + step)) * count;
            endpoint.receive_into(
                ids[pos + step],
                Tag::Allgather,
                &mut recv[step * count..step * count + incoming],
            )?;
        }
    }

    // Phase B: everyone gets the assembled buffer.
    broadcast(endpoint, ids, ids[0], recv)
}

/// Reduces `buf` elementwise with `fold` across all participants; afterwards
/// every participant holds the same folded result.
pub fn allreduce<T: Payload + Clone>(
    endpoint: &Endpoint,
    ids: &[ProcessId],
    buf: &mut [T],
    fold: impl Fn(&T, &T) -> T,
) -> Result<()> {
    allreduce_index(endpoint, ids, buf, |a, b, _| fold(a, b))
}

/// Like [`allreduce`], but the operator additionally receives the position
/// of the element being folded within the buffer.
pub fn allreduce_index<T: Payload + Clone>(
    endpoint: &Endpoint,
    ids: &[ProcessId],
    buf: &mut [T],
    fold: impl Fn(&T, &T, usize) -> T,
) -> Result<()> {
    let np = ids.len();
    if np <= 1 {
        return Ok(());
    }

    let pos = position_of(endpoint, ids, endpoint.id())?;

    for round in 0..rounds_for(np) {
        let step = 1usize << round;
        let group = step << 1;

        if pos >= step && (pos - step) % group == 0 {
            endpoint.send_slice(ids[pos - step], buf, Tag::Allreduce)?;
        } else if pos % group == 0 && pos + step < np {
            let incoming: Vec<T> = endpoint.receive_vec(ids[pos + step], Tag::Allreduce)?;

            for (at, (acc, value)) in buf.iter_mut().zip(&incoming).enumerate() {
                *acc = fold(acc, value, at);
            }
        }
    }

    broadcast(endpoint, ids, ids[0], buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs `body` on `np` endpoints, one thread each, and returns the
    /// per-process results in process-id order.
    fn on_mesh<R: Send>(
        np: usize,
        body: impl Fn(&Endpoint) -> R + Send + Sync,
    ) -> Vec<R> {
        let endpoints = Endpoint::full_mesh(np);
        let body = &body;

        std::thread::scope(|scope| {
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|ep| scope.spawn(move || body(&ep)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn test_broadcast_all_hold_root_value() {
        for np in [1, 2, 3, 4, 5, 8] {
            let ids: Vec<_> = (0..np).collect();
            let got = on_mesh(np, |ep| {
                let mut buf = [if ep.id() == np - 1 { 77i64 } else { 0 }];
                broadcast(ep, &ids, np - 1, &mut buf).unwrap();
                buf[0]
            });
            assert!(got.iter().all(|&v| v == 77), "np = {}: {:?}", np, got);
        }
    }

    #[test]
    fn test_allgather_ordered_by_ids_slice() {
        // Scenario: values 10, 20, 30 contributed by the processes at ids
        // positions [2, 0, 1]; every process must end up with [10, 20, 30].
        let ids = vec![2usize, 0, 1];
        let got = on_mesh(3, |ep| {
            let at = ids.iter().position(|&p| p == ep.id()).unwrap();
            let send = [(at as i64 + 1) * 10];
            let mut recv = [0i64; 3];
            allgather(ep, &ids, &send, &mut recv).unwrap();
            recv
        });

        for recv in got {
            assert_eq!(recv, [10, 20, 30]);
        }
    }

    #[test]
    fn test_allgather_multi_element_blocks() {
        let ids: Vec<_> = (0..5).collect();
        let got = on_mesh(5, |ep| {
            let send = [ep.id() as i32, -(ep.id() as i32)];
            let mut recv = [0i32; 10];
            allgather(ep, &ids, &send, &mut recv).unwrap();
            recv
        });

        for recv in got {
            assert_eq!(recv, [0, 0, 1, -1, 2, -2, 3, -3, 4, -4]);
        }
    }

    #[test]
    fn test_allreduce_sum() {
        // Scenario: inputs {1, 2, 4, 8} across four processes fold to 15.
        let ids: Vec<_> = (0..4).collect();
        let got = on_mesh(4, |ep| {
            let mut buf = [1i64 << ep.id()];
            allreduce(ep, &ids, &mut buf, |a, b| a + b).unwrap();
            buf[0]
        });
        assert_eq!(got, vec![15, 15, 15, 15]);
    }

    #[test]
    fn test_allreduce_vector_odd_np() {
        let ids: Vec<_> = (0..3).collect();
        let got = on_mesh(3, |ep| {
            let mut buf = vec![ep.id() as i64; 4];
            allreduce(ep, &ids, &mut buf, |a, b| *a.max(b)).unwrap();
            buf
        });

        for buf in got {
            assert_eq!(buf, vec![2, 2, 2, 2]);
        }
    }
}
