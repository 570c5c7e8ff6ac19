use crate::aio::{
    self, AioError, AioReturnSlot, CallbackId, CallbackOps, HandleFlags, HandleState, IoOp, IoVec,
    ReportLevel, ResultStatus, SUBMIT_BATCH_SIZE, WaitRef, describe_identity, result_report,
};
use crate::buffer::{
    BufferFlags, buffer_tag, release_buffer, start_read_buffers, wait_read_buffers, with_page,
};
use crate::config::Builder;
use crate::context;
use crate::method::IoMethod;
use crate::storage::{BLCKSZ, BlockNumber, ForkNumber, SmgrRelation};
use crate::test_utils::*;
use crate::{Aio, ResourceOwner};
use std::sync::mpsc;
use std::thread;

/// Starts reading `buf.len() / BLCKSZ` blocks of `rel` into `buf`.
fn start_read(
    rel: &SmgrRelation,
    blocknum: BlockNumber,
    buf: &mut [u8],
    ret: Option<&AioReturnSlot>,
) -> Result<WaitRef, AioError> {
    let ioh = aio::acquire(None, ret)?;
    let wref = ioh.wref();
    let iovecs: Vec<IoVec> = buf.chunks_mut(BLCKSZ).map(IoVec::from_mut_slice).collect();

    // SAFETY: callers wait for the IO before touching `buf`.
    unsafe { rel.start_readv(ioh, ForkNumber::Main, blocknum, &iovecs)? };
    Ok(wref)
}

fn handle_state(id: u32) -> HandleState {
    context::with_shared(|shared| shared.pool.get(id).state())
}

fn handle_generation(id: u32) -> u64 {
    context::with_shared(|shared| shared.pool.get(id).generation())
}

fn next_idle() -> u32 {
    context::with_core(|core| {
        *core
            .idle
            .borrow()
            .front()
            .expect("backend has no idle handle")
    })
}

fn assert_pattern(buf: &[u8], first_block: BlockNumber) {
    for (i, block) in buf.chunks(BLCKSZ).enumerate() {
        let blocknum = first_block + i as BlockNumber;
        assert!(
            block == pattern_block(blocknum).as_slice(),
            "block {blocknum} has unexpected contents"
        );
    }
}

#[crate::test(io_method = "sync")]
fn test_acquire_release_round_trip() -> anyhow::Result<()> {
    let idle = num_idle();
    let id = next_idle();
    let generation = handle_generation(id);

    let ioh = aio::acquire(None, None)?;
    assert_eq!(ioh.id(), id);
    assert_eq!(handle_state(id), HandleState::HandedOut);
    assert_eq!(num_idle(), idle - 1);

    ioh.release()?;
    assert_eq!(handle_state(id), HandleState::Idle);
    assert_eq!(handle_generation(id), generation + 1);
    assert_eq!(num_idle(), idle);
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_only_one_handed_out() -> anyhow::Result<()> {
    let ioh = aio::acquire(None, None)?;
    assert!(matches!(
        aio::acquire(None, None),
        Err(AioError::AlreadyHandedOut)
    ));
    assert!(matches!(
        aio::acquire_nb(None, None),
        Err(AioError::AlreadyHandedOut)
    ));
    ioh.release()?;
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_handle_definition_errors() -> anyhow::Result<()> {
    let mut ioh = aio::acquire(None, None)?;

    let too_many: Vec<u32> = (0..64).collect();
    assert!(matches!(
        ioh.set_handle_data_32(&too_many),
        Err(AioError::HandleDataTooLarge { len: 64, .. })
    ));
    ioh.set_handle_data_64(&[1, 2, 3])?;

    assert!(matches!(
        ioh.register_callbacks(CallbackId::INVALID, 0),
        Err(AioError::CallbackOutOfRange(0))
    ));
    assert!(matches!(
        ioh.register_callbacks(CallbackId::custom(3), 0),
        Err(AioError::CallbackOutOfRange(_))
    ));

    ioh.release()?;
    Ok(())
}

fn read_whole_rel(rel_number: u32) -> anyhow::Result<()> {
    let rel = create_rel(rel_number, 12)?;
    let mut buf = block_buffer(12);
    let slot = AioReturnSlot::new();

    let wref = start_read(&rel, 0, &mut buf, Some(&slot))?;
    wref.wait()?;

    let ret = slot.get();
    assert_eq!(ret.result.status, ResultStatus::Ok);
    assert_eq!(ret.result.id, CallbackId::MD_READV);
    assert_eq!(ret.result.result, 12);
    assert_pattern(&buf, 0);
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_read_sync() -> anyhow::Result<()> {
    read_whole_rel(10)
}

#[crate::test(io_method = "worker", io_workers = 2)]
fn test_read_worker() -> anyhow::Result<()> {
    read_whole_rel(10)
}

#[crate::test(io_method = "io_uring")]
fn test_read_io_uring() -> anyhow::Result<()> {
    read_whole_rel(10)
}

fn write_then_read(rel_number: u32) -> anyhow::Result<()> {
    let rel = create_rel(rel_number, 4)?;
    let data: Vec<u8> = (0..2 * BLCKSZ).map(|i| (i % 251) as u8).collect();
    let mut out = data.clone();
    let slot = AioReturnSlot::new();

    let ioh = aio::acquire(None, Some(&slot))?;
    let wref = ioh.wref();
    let iovecs: Vec<IoVec> = out.chunks_mut(BLCKSZ).map(IoVec::from_mut_slice).collect();
    // SAFETY: `out` is not touched until the write completed.
    unsafe { rel.start_writev(ioh, ForkNumber::Main, 1, &iovecs, false)? };
    wref.wait()?;

    assert_eq!(slot.status(), ResultStatus::Ok);
    assert_eq!(slot.get().result.id, CallbackId::MD_WRITEV);
    assert_eq!(slot.get().result.result, 2);

    let mut block = block_buffer(1);
    rel.read(ForkNumber::Main, 1, &mut block)?;
    assert_eq!(block, data[..BLCKSZ]);
    rel.read(ForkNumber::Main, 2, &mut block)?;
    assert_eq!(block, data[BLCKSZ..]);
    rel.read(ForkNumber::Main, 3, &mut block)?;
    assert_eq!(block, pattern_block(3));
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_write_sync() -> anyhow::Result<()> {
    write_then_read(11)
}

#[crate::test(io_method = "worker")]
fn test_write_worker() -> anyhow::Result<()> {
    write_then_read(11)
}

#[crate::test(io_method = "io_uring")]
fn test_write_io_uring() -> anyhow::Result<()> {
    write_then_read(11)
}

#[crate::test(io_method = "worker", max_concurrency = 2, io_workers = 2)]
fn test_backpressure_bounds_in_flight() -> anyhow::Result<()> {
    let rel = create_rel(12, 16)?;
    let mut bufs: Vec<Vec<u8>> = (0..16).map(|_| block_buffer(1)).collect();

    let mut wrefs = Vec::new();
    for (blocknum, buf) in bufs.iter_mut().enumerate() {
        wrefs.push(start_read(&rel, blocknum as BlockNumber, buf, None)?);
        assert!(num_in_flight() <= 2);
    }
    for wref in wrefs {
        wref.wait()?;
    }

    for (blocknum, buf) in bufs.iter().enumerate() {
        assert_pattern(buf, blocknum as BlockNumber);
    }
    Ok(())
}

#[crate::test(io_method = "worker", max_concurrency = 2)]
fn test_acquire_nb_when_exhausted() -> anyhow::Result<()> {
    let rel = create_rel(13, 2)?;
    let mut bufs = [block_buffer(1), block_buffer(1)];

    aio::enter_batchmode();
    let [b0, b1] = &mut bufs;
    let w0 = start_read(&rel, 0, b0, None)?;
    let w1 = start_read(&rel, 1, b1, None)?;

    // Both handles are staged and nothing would free one without waiting.
    assert!(aio::acquire_nb(None, None)?.is_none());
    aio::exit_batchmode();

    w0.wait()?;
    w1.wait()?;
    assert_pattern(&bufs[0], 0);
    assert_pattern(&bufs[1], 1);

    let ioh = aio::acquire_nb(None, None)?.expect("handles were reclaimed");
    ioh.release()?;
    Ok(())
}

#[crate::test(io_method = "worker", io_workers = 2)]
fn test_batchmode_defers_submission() -> anyhow::Result<()> {
    let rel = create_rel(14, 3)?;
    let mut bufs = [block_buffer(1), block_buffer(1), block_buffer(1)];
    let slots: [AioReturnSlot; 3] = Default::default();

    aio::enter_batchmode();
    let mut wrefs = Vec::new();
    for (i, (buf, slot)) in bufs.iter_mut().zip(&slots).enumerate() {
        wrefs.push(start_read(&rel, i as BlockNumber, buf, Some(slot))?);
    }
    assert!(aio::have_staged());
    for wref in &wrefs {
        assert_eq!(handle_state(wref.id()), HandleState::Staged);
    }

    aio::exit_batchmode();
    assert!(!aio::have_staged());

    for wref in wrefs {
        wref.wait()?;
    }
    for (i, slot) in slots.iter().enumerate() {
        assert_eq!(slot.status(), ResultStatus::Ok);
        assert_pattern(&bufs[i], i as BlockNumber);
    }
    Ok(())
}

#[crate::test(io_method = "worker", max_concurrency = 40, io_workers = 1)]
fn test_full_batch_gets_submitted() -> anyhow::Result<()> {
    let rel = create_rel(15, SUBMIT_BATCH_SIZE as u32)?;
    let mut bufs: Vec<Vec<u8>> = (0..SUBMIT_BATCH_SIZE).map(|_| block_buffer(1)).collect();

    aio::enter_batchmode();
    let mut wrefs = Vec::new();
    for (blocknum, buf) in bufs.iter_mut().enumerate() {
        wrefs.push(start_read(&rel, blocknum as BlockNumber, buf, None)?);
    }
    assert!(aio::have_staged());

    // Acquiring with a full batch submits it.
    let ioh = aio::acquire(None, None)?;
    assert!(!aio::have_staged());
    ioh.release()?;
    aio::exit_batchmode();

    for wref in wrefs {
        wref.wait()?;
    }
    for (blocknum, buf) in bufs.iter().enumerate() {
        assert_pattern(buf, blocknum as BlockNumber);
    }
    Ok(())
}

#[crate::test(io_method = "sync")]
#[should_panic(expected = "starting batch while batch already in progress")]
fn test_batchmode_reentry_panics() {
    aio::enter_batchmode();
    aio::enter_batchmode();
}

#[crate::test(io_method = "worker", io_workers = 2)]
fn test_local_io_runs_ahead_of_batch() -> anyhow::Result<()> {
    let rel = create_rel(16, 4)?;
    let temp = create_temp_rel(17, 4)?;
    let mut bufs = [block_buffer(1), block_buffer(1), block_buffer(1)];
    let slots: [AioReturnSlot; 3] = Default::default();

    aio::enter_batchmode();
    let [b0, b1, b2] = &mut bufs;
    let w0 = start_read(&rel, 0, b0, Some(&slots[0]))?;
    let w1 = start_read(&temp, 1, b1, Some(&slots[1]))?;

    // References our memory, so we executed it right away.
    assert_eq!(slots[1].status(), ResultStatus::Ok);
    assert_eq!(handle_state(w1.id()), HandleState::Idle);

    let w2 = start_read(&rel, 2, b2, Some(&slots[2]))?;
    assert!(aio::have_staged());
    aio::exit_batchmode();

    for wref in [w0, w1, w2] {
        wref.wait()?;
    }
    for (i, slot) in slots.iter().enumerate() {
        let ret = slot.get();
        assert_eq!(ret.result.status, ResultStatus::Ok);
        assert_eq!(ret.result.result, 1);
        assert_pattern(&bufs[i], i as BlockNumber);
    }
    Ok(())
}

#[crate::test(io_method = "worker")]
fn test_synchronous_flag_skips_submission() -> anyhow::Result<()> {
    let rel = create_rel(18, 1)?;
    let mut buf = block_buffer(1);
    let slot = AioReturnSlot::new();

    let mut ioh = aio::acquire(None, Some(&slot))?;
    ioh.set_flag(HandleFlags::SYNCHRONOUS);
    // SAFETY: the IO completes before start_readv returns.
    unsafe {
        rel.start_readv(
            ioh,
            ForkNumber::Main,
            0,
            &[IoVec::from_mut_slice(&mut buf)],
        )?
    };

    assert_eq!(slot.status(), ResultStatus::Ok);
    assert_eq!(num_in_flight(), 0);
    assert_pattern(&buf, 0);
    Ok(())
}

fn callback_counts(
    io_method: IoMethod,
    ops: &'static CallbackOps,
    counts: &CountingCallbacks,
) -> anyhow::Result<()> {
    let (_dir, aio) = init_aio(Builder::new().io_method(io_method).callbacks(ops))?;
    let _backend = aio.attach()?;

    let rel = create_rel(19, 2)?;
    let mut buf = block_buffer(2);
    let slot = AioReturnSlot::new();

    let mut ioh = aio::acquire(None, Some(&slot))?;
    ioh.register_callbacks(CallbackId::custom(0), 7)?;
    let wref = ioh.wref();
    let iovecs: Vec<IoVec> = buf.chunks_mut(BLCKSZ).map(IoVec::from_mut_slice).collect();
    // SAFETY: waited for below.
    unsafe { rel.start_readv(ioh, ForkNumber::Main, 0, &iovecs)? };
    wref.wait()?;

    assert_eq!(counts.counts(), (1, 1, 1));
    // md ran first and set the result, the counting callbacks passed it on.
    assert_eq!(slot.get().result.id, CallbackId::MD_READV);
    assert_eq!(slot.get().result.result, 2);
    assert_pattern(&buf, 0);
    Ok(())
}

#[test]
fn test_callbacks_run_once_sync() -> anyhow::Result<()> {
    counting_callbacks!(counted);
    callback_counts(IoMethod::Sync, &counted::OPS, &counted::COUNTS)
}

#[test]
fn test_callbacks_run_once_worker() -> anyhow::Result<()> {
    counting_callbacks!(counted);
    callback_counts(IoMethod::Worker, &counted::OPS, &counted::COUNTS)
}

mod ordered {
    use crate::aio::{AioResult, CallbackOps, IoRef};
    use parking_lot::Mutex;

    pub(crate) static CALLS: Mutex<Vec<(&'static str, u8)>> = Mutex::new(Vec::new());

    pub(crate) static OPS: CallbackOps = CallbackOps {
        name: "ordered",
        stage: Some(stage),
        complete_shared: Some(complete_shared),
        complete_local: Some(complete_local),
        report: None,
    };

    fn stage(_io: &mut IoRef<'_>, cb_data: u8) {
        CALLS.lock().push(("stage", cb_data));
    }

    fn complete_shared(_io: &mut IoRef<'_>, prior: AioResult, cb_data: u8) -> AioResult {
        CALLS.lock().push(("shared", cb_data));
        prior
    }

    fn complete_local(_io: &mut IoRef<'_>, prior: AioResult, cb_data: u8) -> AioResult {
        CALLS.lock().push(("local", cb_data));
        prior
    }
}

#[test]
fn test_callbacks_run_in_reverse_registration_order() -> anyhow::Result<()> {
    let (_dir, aio) = init_aio(Builder::new().io_method(IoMethod::Sync).callbacks(&ordered::OPS))?;
    let _backend = aio.attach()?;

    let rel = create_rel(40, 1)?;
    let mut buf = block_buffer(1);

    let mut ioh = aio::acquire(None, None)?;
    for cb_data in 1..=3 {
        ioh.register_callbacks(CallbackId::custom(0), cb_data)?;
    }
    let wref = ioh.wref();
    // SAFETY: waited for below.
    unsafe {
        rel.start_readv(
            ioh,
            ForkNumber::Main,
            0,
            &[IoVec::from_mut_slice(&mut buf)],
        )?
    };
    wref.wait()?;

    let calls = ordered::CALLS.lock().clone();
    let expected: Vec<_> = ["stage", "shared", "local"]
        .into_iter()
        .flat_map(|phase| [(phase, 3), (phase, 2), (phase, 1)])
        .collect();
    assert_eq!(calls, expected);
    assert_pattern(&buf, 0);
    Ok(())
}

/// Writes block 42 from a second backend and waits for it from this one,
/// which may have to reap the completion itself.
fn wait_across_backends(aio: &Aio, rel_number: u32) -> anyhow::Result<()> {
    let rel = create_rel(rel_number, 43)?;
    let data = vec![0xabu8; BLCKSZ];
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| -> anyhow::Result<()> {
        let writer = s.spawn(|| -> anyhow::Result<()> {
            let mut out = data.clone();
            let _backend = aio.attach()?;

            let ioh = aio::acquire(None, None)?;
            let wref = ioh.wref();
            // SAFETY: detaching waits for the write, `out` outlives it.
            unsafe {
                rel.start_writev(
                    ioh,
                    ForkNumber::Main,
                    42,
                    &[IoVec::from_mut_slice(&mut out)],
                    false,
                )?
            };
            tx.send(wref)?;
            Ok(())
        });

        let wref = rx.recv()?;
        wref.wait()?;
        assert!(wref.check_done());

        writer.join().expect("writer panicked")?;
        Ok(())
    })?;

    let mut block = block_buffer(1);
    rel.read(ForkNumber::Main, 42, &mut block)?;
    assert_eq!(block, data);
    rel.read(ForkNumber::Main, 41, &mut block)?;
    assert_eq!(block, pattern_block(41));
    Ok(())
}

#[crate::test(io_method = "worker", io_workers = 2)]
fn test_wait_across_backends_worker(aio: &Aio) -> anyhow::Result<()> {
    wait_across_backends(aio, 20)
}

#[crate::test(io_method = "io_uring")]
fn test_wait_across_backends_io_uring(aio: &Aio) -> anyhow::Result<()> {
    wait_across_backends(aio, 41)
}

/// Checks that every handle of this backend is tracked by exactly the list
/// its state calls for.
fn assert_lists_match_states() {
    context::with_context(|ctx| {
        let core = &ctx.core;
        let idle = core.idle.borrow();
        let staged = core.staged.borrow();
        let in_flight = core.in_flight.borrow();

        for index in core.handles() {
            let state = ctx.shared.pool.get(index).state();
            let mut lists = Vec::new();
            if idle.contains(&index) {
                lists.push("idle");
            }
            if core.handed_out.get() == Some(index) {
                lists.push("handed out");
            }
            if staged.contains(&index) {
                lists.push("staged");
            }
            if in_flight.contains(&index) {
                lists.push("in flight");
            }

            let expected = match state {
                HandleState::Idle => "idle",
                HandleState::HandedOut | HandleState::Defined => "handed out",
                HandleState::Staged => "staged",
                HandleState::Submitted
                | HandleState::CompletedIo
                | HandleState::CompletedShared => "in flight",
                HandleState::CompletedLocal => panic!("IO {index} left in {state}"),
            };
            assert_eq!(lists, [expected], "IO {index} in state {state}");
        }
    });
}

#[crate::test(io_method = "worker", max_concurrency = 8, io_workers = 1)]
fn test_lists_match_states_during_batch() -> anyhow::Result<()> {
    let rel = create_rel(42, 4)?;
    let mut bufs = [block_buffer(1), block_buffer(1), block_buffer(1), block_buffer(1)];
    let idle = num_idle();
    assert_lists_match_states();

    aio::enter_batchmode();
    let mut wrefs = Vec::new();
    for (i, buf) in bufs.iter_mut().enumerate() {
        let ioh = aio::acquire(None, None)?;
        assert_lists_match_states();

        wrefs.push(ioh.wref());
        // SAFETY: waited for below.
        unsafe {
            rel.start_readv(
                ioh,
                ForkNumber::Main,
                i as BlockNumber,
                &[IoVec::from_mut_slice(buf)],
            )?
        };
        assert_lists_match_states();
    }
    assert_eq!(context::with_core(|core| core.num_staged()), 4);

    aio::exit_batchmode();
    assert_lists_match_states();

    for wref in wrefs {
        wref.wait()?;
        assert_lists_match_states();
    }
    assert_eq!(num_idle(), idle);
    for (i, buf) in bufs.iter().enumerate() {
        assert_pattern(buf, i as BlockNumber);
    }
    Ok(())
}

#[crate::test(io_method = "worker")]
fn test_start_rejects_too_many_iovecs() -> anyhow::Result<()> {
    let rel = create_rel(43, 17)?;
    // Separate allocations, so nothing gets combined.
    let mut bufs: Vec<Vec<u8>> = (0..17).map(|_| block_buffer(1)).collect();
    let iovecs: Vec<IoVec> = bufs.iter_mut().map(|b| IoVec::from_mut_slice(b)).collect();
    let idle = num_idle();

    let ioh = aio::acquire(None, None)?;
    let id = ioh.id();
    // SAFETY: the IO is rejected before it starts.
    let err = unsafe { rel.start_readv(ioh, ForkNumber::Main, 0, &iovecs) }.unwrap_err();
    assert!(matches!(err, AioError::TooManyIovecs { len: 17, max: 16 }), "{err}");
    assert_eq!(handle_state(id), HandleState::Idle);
    assert_eq!(num_idle(), idle);

    // The backend can go on, with one IO per combine limit.
    let mut wrefs = Vec::new();
    for (blocknum, chunk) in [(0, &iovecs[..16]), (16, &iovecs[16..])] {
        let ioh = aio::acquire(None, None)?;
        wrefs.push(ioh.wref());
        // SAFETY: waited for below.
        unsafe { rel.start_readv(ioh, ForkNumber::Main, blocknum, chunk)? };
    }
    for wref in wrefs {
        wref.wait()?;
    }
    for (i, buf) in bufs.iter().enumerate() {
        assert_pattern(buf, i as BlockNumber);
    }
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_start_rejects_oversized_transfer() -> anyhow::Result<()> {
    let rel = create_rel(44, 1)?;
    let mut buf = block_buffer(1);
    let half = 1usize << 30;
    // Never dereferenced, the size check comes first.
    let huge = [
        IoVec::new(buf.as_mut_ptr(), half),
        IoVec::new(buf.as_mut_ptr(), half),
    ];
    assert!(matches!(
        aio::check_iovecs(&huge),
        Err(AioError::TransferTooLarge(total)) if total == 1 << 31
    ));
    assert!(aio::check_iovecs(&huge[..1]).is_ok());

    let ioh = aio::acquire(None, None)?;
    let id = ioh.id();
    // SAFETY: rejected before anything is read.
    let err = unsafe { ioh.start_readv(-1, &huge, 0) }.unwrap_err();
    assert!(matches!(err, AioError::TransferTooLarge(_)), "{err}");
    assert_eq!(handle_state(id), HandleState::Idle);

    // Nothing was left handed out.
    let ioh = aio::acquire(None, None)?;
    let wref = ioh.wref();
    // SAFETY: waited for below.
    unsafe {
        rel.start_readv(
            ioh,
            ForkNumber::Main,
            0,
            &[IoVec::from_mut_slice(&mut buf)],
        )?
    };
    wref.wait()?;
    assert_pattern(&buf, 0);
    Ok(())
}

fn skip_fsync_of(slot: &AioReturnSlot) -> bool {
    slot.get()
        .target_data
        .as_smgr()
        .map(|td| td.skip_fsync)
        .expect("IO targets a relation")
}

#[crate::test(io_method = "worker")]
fn test_target_carries_skip_fsync() -> anyhow::Result<()> {
    let rel = create_rel(45, 2)?;
    let temp = create_temp_rel(46, 1)?;
    let mut out = pattern_block(1);
    let mut buf = block_buffer(1);
    let slot = AioReturnSlot::new();

    for skip_fsync in [false, true] {
        let ioh = aio::acquire(None, Some(&slot))?;
        let wref = ioh.wref();
        // SAFETY: waited for below, `out` stays untouched.
        unsafe {
            rel.start_writev(
                ioh,
                ForkNumber::Main,
                1,
                &[IoVec::from_mut_slice(&mut out)],
                skip_fsync,
            )?
        };
        wref.wait()?;
        assert_eq!(slot.status(), ResultStatus::Ok);
        assert_eq!(skip_fsync_of(&slot), skip_fsync);
    }

    let wref = start_read(&rel, 0, &mut buf, Some(&slot))?;
    wref.wait()?;
    assert!(!skip_fsync_of(&slot));

    // Temp relations are never fsynced.
    let wref = start_read(&temp, 0, &mut buf, Some(&slot))?;
    wref.wait()?;
    assert!(skip_fsync_of(&slot));
    assert_pattern(&buf, 0);
    Ok(())
}

#[crate::test(io_method = "worker")]
fn test_old_wref_after_recycle() -> anyhow::Result<()> {
    let rel = create_rel(21, 2)?;
    let mut first = block_buffer(1);
    let mut second = block_buffer(1);

    let old = start_read(&rel, 0, &mut first, None)?;
    old.wait()?;

    // The idle list hands out the most recently reclaimed handle.
    let ioh = aio::acquire(None, None)?;
    assert_eq!(ioh.id(), old.id());
    assert_eq!(handle_state(old.id()), HandleState::HandedOut);

    // Waiting on a handed out handle would be an error, the old reference
    // must see the recycle instead.
    assert!(old.check_done());
    old.wait()?;

    let new = ioh.wref();
    assert_ne!(new, old);
    // SAFETY: waited for below.
    unsafe {
        rel.start_readv(ioh, ForkNumber::Main, 1, &[IoVec::from_mut_slice(&mut second)])?
    };
    old.wait()?;
    new.wait()?;

    assert_pattern(&first, 0);
    assert_pattern(&second, 1);
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_resowner_releases_leaked_handle() -> anyhow::Result<()> {
    let owner = ResourceOwner::new("leaky");
    let idle = num_idle();

    let ioh = aio::acquire(Some(&owner), None)?;
    assert_eq!(owner.num_ios(), 1);
    let id = ioh.id();
    drop(ioh);

    owner.release(false)?;
    assert_eq!(owner.num_ios(), 0);
    assert_eq!(handle_state(id), HandleState::Idle);
    assert_eq!(num_idle(), idle);

    // Handed out handles are tracked by the backend, not the IoHandle.
    let ioh = aio::acquire(None, None)?;
    ioh.release()?;
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_resowner_forgets_reclaimed() -> anyhow::Result<()> {
    let owner = ResourceOwner::new("reader");
    let rel = create_rel(22, 1)?;
    let mut buf = block_buffer(1);

    let ioh = aio::acquire(Some(&owner), None)?;
    assert_eq!(owner.num_ios(), 1);
    // SAFETY: the sync method completes the read before returning.
    unsafe { rel.start_readv(ioh, ForkNumber::Main, 0, &[IoVec::from_mut_slice(&mut buf)])? };

    assert_eq!(owner.num_ios(), 0);
    owner.release(false)?;
    assert_pattern(&buf, 0);
    Ok(())
}

#[crate::test(io_method = "worker")]
fn test_resowner_release_submits_and_forgets_return() -> anyhow::Result<()> {
    let owner = ResourceOwner::new("aborted");
    let rel = create_rel(23, 1)?;
    let mut buf = block_buffer(1);
    let slot = AioReturnSlot::new();

    aio::enter_batchmode();
    let ioh = aio::acquire(Some(&owner), Some(&slot))?;
    let wref = ioh.wref();
    // SAFETY: waited for below.
    unsafe { rel.start_readv(ioh, ForkNumber::Main, 0, &[IoVec::from_mut_slice(&mut buf)])? };
    assert!(aio::have_staged());

    owner.release(true)?;
    assert!(!aio::have_staged());
    aio::exit_batchmode();

    wref.wait()?;
    // Nobody is interested in the outcome anymore.
    assert_eq!(slot.status(), ResultStatus::Unknown);
    assert_pattern(&buf, 0);
    Ok(())
}

#[crate::test(io_method = "worker")]
fn test_error_cleanup_leaves_batchmode() -> anyhow::Result<()> {
    let rel = create_rel(24, 1)?;
    let mut buf = block_buffer(1);

    aio::enter_batchmode();
    let wref = start_read(&rel, 0, &mut buf, None)?;
    aio::error_cleanup();

    // Not in batch mode anymore, so this does not panic.
    aio::enter_batchmode();
    aio::at_eoxact(false);
    aio::enter_batchmode();
    aio::exit_batchmode();
    aio::at_eoxact(true);

    wref.wait()?;
    assert_pattern(&buf, 0);
    Ok(())
}

#[crate::test(io_method = "io_uring")]
fn test_closing_fd_waits_for_io() -> anyhow::Result<()> {
    let rel = create_rel(25, 8)?;
    let mut buf = block_buffer(8);
    let slot = AioReturnSlot::new();

    let fd = context::with_smgr_mut(|smgr| smgr.fd(&rel, ForkNumber::Main, 0, false))?;
    let _wref = start_read(&rel, 0, &mut buf, Some(&slot))?;

    aio::closing_fd(fd)?;
    let fd_in_flight = context::with_context(|ctx| {
        ctx.core
            .in_flight
            .borrow()
            .iter()
            .any(|&index| ctx.shared.pool.get(index).lock().op_data().fd() == Some(fd))
    });
    assert!(!fd_in_flight);
    assert_eq!(slot.status(), ResultStatus::Ok);
    assert_pattern(&buf, 0);

    rel.close(ForkNumber::Main)?;
    Ok(())
}

#[crate::test(io_method = "worker")]
fn test_close_with_io_in_flight() -> anyhow::Result<()> {
    let rel = create_rel(26, 4)?;
    let mut buf = block_buffer(4);

    let wref = start_read(&rel, 0, &mut buf, None)?;
    // Workers reopen the file themselves.
    rel.close(ForkNumber::Main)?;
    wref.wait()?;
    assert_pattern(&buf, 0);
    Ok(())
}

/// Caps every transfer at one and a half blocks.
fn cap_at_one_and_a_half_blocks(io: &mut crate::aio::IoRef<'_>) {
    let cap = (BLCKSZ + BLCKSZ / 2) as i32;
    if io.result() > cap {
        io.set_result(cap);
    }
}

fn short_read_zero_fills(aio: &Aio) -> anyhow::Result<()> {
    let rel = create_rel(27, 8)?;
    let mut buf = vec![0xffu8; 8 * BLCKSZ];
    let slot = AioReturnSlot::new();

    aio.set_completion_hook(Some(cap_at_one_and_a_half_blocks));
    let wref = start_read(&rel, 0, &mut buf, Some(&slot))?;
    wref.wait()?;

    let ret = slot.get();
    assert_eq!(ret.result.status, ResultStatus::Partial);
    assert_eq!(ret.result.result, 1);
    assert_eq!(ret.result.error_data() as usize, BLCKSZ + BLCKSZ / 2);

    let read = BLCKSZ + BLCKSZ / 2;
    assert_pattern(&buf[..BLCKSZ], 0);
    assert_eq!(buf[BLCKSZ..read], pattern_block(1)[..BLCKSZ / 2]);
    assert!(buf[read..].iter().all(|&b| b == 0));

    let identity = describe_identity(&ret.target_data);
    assert!(identity.contains("blocks 0..7"), "{identity}");

    result_report(&ret.result, &ret.target_data, ReportLevel::Warning)?;
    let err = result_report(&ret.result, &ret.target_data, ReportLevel::Error)
        .expect_err("short read reported at ERROR");
    assert!(err.is_retryable());
    assert!(
        err.to_string().ends_with("read only 12288 of 65536 bytes"),
        "{err}"
    );
    Ok(())
}

#[crate::test(io_method = "io_uring")]
fn test_short_read_io_uring(aio: &Aio) -> anyhow::Result<()> {
    short_read_zero_fills(aio)
}

#[crate::test(io_method = "worker")]
fn test_short_read_worker(aio: &Aio) -> anyhow::Result<()> {
    short_read_zero_fills(aio)
}

#[crate::test(io_method = "sync")]
fn test_io_error_reported(aio: &Aio) -> anyhow::Result<()> {
    let rel = create_rel(28, 1)?;
    let mut buf = block_buffer(1);
    let slot = AioReturnSlot::new();

    aio.set_completion_hook(Some(eio_hook));
    start_read(&rel, 0, &mut buf, Some(&slot))?;

    let ret = slot.get();
    assert_eq!(ret.result.status, ResultStatus::Error);
    assert_eq!(ret.result.id, CallbackId::MD_READV);
    assert_eq!(ret.result.error_data(), libc::EIO as u32);

    let err = result_report(&ret.result, &ret.target_data, ReportLevel::Error)
        .expect_err("EIO reported at ERROR");
    assert!(!err.is_retryable());
    let msg = err.to_string();
    assert!(msg.starts_with("could not read blocks 0..0 in file"), "{msg}");
    assert!(msg.contains("base/5/28"), "{msg}");
    Ok(())
}

#[crate::test(io_method = "worker", io_workers = 2)]
fn test_snapshot_lists_busy_handles(aio: &Aio) -> anyhow::Result<()> {
    let rel = create_rel(29, 4)?;
    let mut buf = block_buffer(1);
    assert!(aio.snapshot().is_empty());
    assert_eq!(aio.num_attached(), 3);
    assert!(aio.shmem_size() > 0);

    aio::enter_batchmode();
    let wref = start_read(&rel, 3, &mut buf, None)?;

    let snapshot = aio.snapshot();
    assert_eq!(snapshot.len(), 1);
    let snap = &snapshot[0];
    assert_eq!(snap.id, wref.id());
    assert_eq!(snap.owner, context::my_procno());
    assert_eq!(snap.state, HandleState::Staged);
    assert_eq!(snap.op, IoOp::Readv);
    assert!(snap.flags.contains(HandleFlags::BUFFERED));
    assert_eq!(snap.num_callbacks, 1);
    assert!(snap.target.starts_with("block 3 in file"), "{}", snap.target);

    aio::exit_batchmode();
    wref.wait()?;
    assert!(aio.snapshot().is_empty());
    assert_pattern(&buf, 3);
    Ok(())
}

fn read_buffers(rel_number: u32) -> anyhow::Result<()> {
    let rel = create_rel(rel_number, 24)?;

    let mut op = start_read_buffers(rel, ForkNumber::Main, 4, 20)?;
    // Capped by the combine limit.
    assert_eq!(op.nblocks(), 16);
    wait_read_buffers(&mut op)?;
    assert!(!op.wait_needed());

    for (i, &buf) in op.buffers().iter().enumerate() {
        let blocknum = 4 + i as BlockNumber;
        assert_eq!(buffer_tag(buf).map(|tag| tag.block), Some(blocknum));
        with_page(buf, |page| assert_pattern(page, blocknum));
    }

    // Already valid, no IO needed.
    let again = start_read_buffers(rel, ForkNumber::Main, 4, 2)?;
    assert!(!again.wait_needed());
    assert_eq!(again.buffers(), &op.buffers()[..2]);

    for &buf in op.buffers().iter().chain(again.buffers()) {
        release_buffer(buf);
    }
    assert_eq!(shared_pins(), 0);
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_read_buffers_sync() -> anyhow::Result<()> {
    read_buffers(30)
}

#[crate::test(io_method = "worker", io_workers = 2)]
fn test_read_buffers_worker() -> anyhow::Result<()> {
    read_buffers(30)
}

#[crate::test(io_method = "io_uring")]
fn test_read_buffers_io_uring() -> anyhow::Result<()> {
    read_buffers(30)
}

#[crate::test(io_method = "worker")]
fn test_read_buffers_retries_partial(aio: &Aio) -> anyhow::Result<()> {
    let rel = create_rel(31, 8)?;
    aio.set_completion_hook(Some(drop_last_block_hook));

    let mut op = start_read_buffers(rel, ForkNumber::Main, 0, 8)?;
    wait_read_buffers(&mut op)?;

    for (i, &buf) in op.buffers().iter().enumerate() {
        with_page(buf, |page| assert_pattern(page, i as BlockNumber));
        release_buffer(buf);
    }
    assert_eq!(shared_pins(), 0);
    Ok(())
}

#[crate::test(io_method = "sync")]
fn test_read_buffers_error_releases_pins(aio: &Aio) -> anyhow::Result<()> {
    let rel = create_rel(32, 4)?;
    aio.set_completion_hook(Some(eio_hook));

    let mut op = start_read_buffers(rel, ForkNumber::Main, 0, 4)?;
    let err = wait_read_buffers(&mut op).expect_err("EIO is an error");
    assert!(matches!(
        err,
        AioError::Report {
            status: ResultStatus::Error,
            ..
        }
    ));
    assert_eq!(shared_pins(), 0);

    let failed = context::with_shared(|shared| {
        (0..shared.buffers.len() as u32)
            .filter(|&index| shared.buffers.flags(index).contains(BufferFlags::IO_ERROR))
            .count()
    });
    assert_eq!(failed, 4);

    // Failed buffers get read again.
    aio.set_completion_hook(None);
    let mut op = start_read_buffers(rel, ForkNumber::Main, 0, 4)?;
    wait_read_buffers(&mut op)?;
    for (i, &buf) in op.buffers().iter().enumerate() {
        with_page(buf, |page| assert_pattern(page, i as BlockNumber));
        release_buffer(buf);
    }
    Ok(())
}

#[crate::test(io_method = "worker", io_workers = 2)]
fn test_read_temp_buffers() -> anyhow::Result<()> {
    let rel = create_temp_rel(33, 6)?;

    let mut op = start_read_buffers(rel, ForkNumber::Main, 0, 6)?;
    wait_read_buffers(&mut op)?;

    for (i, &buf) in op.buffers().iter().enumerate() {
        assert!(buf.is_local());
        with_page(buf, |page| assert_pattern(page, i as BlockNumber));
        release_buffer(buf);
    }
    assert_eq!(shared_pins(), 0);
    Ok(())
}

#[crate::test(io_method = "worker", io_workers = 3)]
fn test_concurrent_readers_share_buffers(aio: &Aio) -> anyhow::Result<()> {
    let rel = create_rel(34, 16)?;

    thread::scope(|s| {
        let readers: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(move || -> anyhow::Result<()> {
                    let _backend = aio.attach()?;
                    for blocknum in (0..16).step_by(4) {
                        let mut op = start_read_buffers(rel, ForkNumber::Main, blocknum, 4)?;
                        wait_read_buffers(&mut op)?;
                        for (i, &buf) in op.buffers().iter().enumerate() {
                            with_page(buf, |page| {
                                assert_pattern(page, blocknum + i as BlockNumber)
                            });
                            release_buffer(buf);
                        }
                    }
                    Ok(())
                })
            })
            .collect();

        readers
            .into_iter()
            .try_for_each(|reader| reader.join().expect("reader panicked"))
    })?;

    assert_eq!(shared_pins(), 0);
    Ok(())
}
