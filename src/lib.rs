#![allow(clippy::deref_addrof)]

pub mod prelude;

pub mod block_tensor;
pub mod blocking;
pub mod density;
pub mod diis;
pub mod grad;
pub mod integrals;
pub mod ix;
pub mod mo2ao;
pub mod packed;
pub mod response;
pub mod scratch;
pub mod structs;
pub mod util;

#[cfg(test)]
pub(crate) mod test_utils;

#[test]
fn end_to_end_on_disk_matches_in_core() {
    use crate::prelude::*;
    use crate::test_utils::*;

    init_logger();
    let p = synthetic_problem(42);
    let SyntheticProblem { info, amps, eris, integrals, .. } = &p;
    let solver = DIISCPHFSolver::new(1e-12);

    let flags = GradFlags::default();
    let reference = ccsd_grad_kernel(info, amps, eris, &p.density(), integrals, &solver, &flags).unwrap();
    assert!(reference.cphf_converged);

    ScratchStore::scoped(None, "test-end-to-end", |inputs| {
        // integrals and densities stay on disk and are only read in blocks
        let eri_blocks = [
            ("oooo", &eris.oooo),
            ("ooov", &eris.ooov),
            ("ovoo", &eris.ovoo),
            ("oovv", &eris.oovv),
            ("ovov", &eris.ovov),
            ("ovvv", &eris.ovvv),
            ("vvvv", &eris.vvvv),
        ];
        let mut on_disk = vec![];
        for (name, blk) in eri_blocks {
            on_disk.push(BlockTensor::OnDisk(inputs.write_dataset(&format!("eris/{name}"), &blk.load()?.view())?));
        }
        let [oooo, ooov, ovoo, oovv, ovov, ovvv, vvvv]: [BlockTensor; 7] =
            on_disk.try_into().map_err(|_| anyhow::anyhow!("unexpected number of eri blocks"))?;
        let eris_disk = CCERIs { fock: eris.fock.to_owned(), oooo, ooov, ovoo, oovv, ovov, ovvv, vvvv };

        inputs.write_dataset("d/doo", &p.doo.view())?;
        inputs.write_dataset("d/dvv", &p.dvv.view())?;
        let d2 = &p.d2;
        let d2_blocks = [
            ("dovov", &d2.dovov),
            ("dvvvv", &d2.dvvvv),
            ("doooo", &d2.doooo),
            ("doovv", &d2.doovv),
            ("dovvo", &d2.dovvo),
            ("dovvv", &d2.dovvv),
            ("dooov", &d2.dooov),
        ];
        for (name, blk) in d2_blocks {
            inputs.write_dataset(&format!("d/{name}"), &blk.load()?.view())?;
        }
        let density = PrecomputedDensity::from_dir(inputs.path().join("d"))?;

        let scratch_dir = inputs.path().join("scratch");
        std::fs::create_dir_all(&scratch_dir)?;
        let flags = GradFlagsBuilder::default().blksize(Some(1)).iobuflen(Some(2)).scratch_dir(Some(scratch_dir.clone())).build()?;
        let out = ccsd_grad_kernel(info, amps, &eris_disk, &density, integrals, &solver, &flags)?;
        assert!((&out.de - &reference.de).abs().max_all() < 1e-10);
        assert!((out.de_total() - reference.de_total()).abs().max_all() < 1e-10);

        // every scratch store of the run has been removed
        assert_eq!(std::fs::read_dir(&scratch_dir)?.count(), 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn end_to_end_memory_budget_monotonicity() {
    use crate::prelude::*;
    use crate::test_utils::*;

    let p = synthetic_problem(7);
    let density = p.density();
    let solver = DIISCPHFSolver::new(1e-12);

    let mut results = vec![];
    for max_memory in [-10.0, 1.0e-3, 2000.0, 1.0e6] {
        let flags = GradFlagsBuilder::default().max_memory(max_memory).build().unwrap();
        results.push(ccsd_grad_kernel(&p.info, &p.amps, &p.eris, &density, &p.integrals, &solver, &flags).unwrap());
    }
    for out in &results[1..] {
        assert!((&out.de - &results[0].de).abs().max_all() < 1e-10);
    }
}
