//! Reduced intermediates `Ioo`, `Ivv`, `Ivo`, `Xvo` of the CCSD gradient.
//!
//! The preamble works in core on the `o⁴`/`o²v²` blocks. Pass 1 streams occupied rows and
//! scatter-writes the `ovvv`-type blocks transposed, so that pass 2 can stream rows of packed
//! virtual pairs against `vvvv`.

use crate::prelude::*;
use crate::blocking::{BLKMIN, prange};

/// Assemble and finalize the intermediates with a scratch store of its own.
pub fn ix_intermediates(
    eris: &CCERIs,
    d1: (&Tsr, &Tsr),
    d2: &CCDensity2,
    flags: &GradFlags,
) -> Result<IXIntermediates> {
    let time = std::time::Instant::now();
    let ix = ScratchStore::scoped(flags.scratch_dir.as_deref(), "ccsd-grad-ix", |store| {
        ix_accumulate(eris, d1, d2, flags, store)
    })?;
    info!("Time elapsed (IX intermediates): {:.3?}", time.elapsed());
    Ok(ix.finalize())
}

/// Raw accumulation of all contraction terms, before [`IXIntermediates::finalize`].
///
/// Scratch entries `dovvo`, `c_vvov` and `e_vvov` are created in `store` and removed before
/// returning.
pub fn ix_accumulate(
    eris: &CCERIs,
    d1: (&Tsr, &Tsr),
    d2: &CCDensity2,
    flags: &GradFlags,
    store: &ScratchStore,
) -> Result<IXIntermediates> {
    let (doo, dvv) = d1;
    let nocc = doo.shape()[0];
    let nvir = dvv.shape()[0];
    eris.check(nocc, nvir)?;
    d2.check(nocc, nvir)?;
    let device = doo.device().clone();

    let mut ix = IXIntermediates::zeros(nocc, nvir, &device);
    ix_preamble(&mut ix, eris, d1, d2, store)?;
    ix_pass1(&mut ix, eris, dvv, d2, flags, store)?;
    ix_pass2(&mut ix, eris, d2, flags, store)?;

    store.remove_group("e_vvov")?;
    store.remove_group("c_vvov")?;
    store.remove_dataset("dovvo")?;
    Ok(ix)
}

fn ix_preamble(
    ix: &mut IXIntermediates,
    eris: &CCERIs,
    d1: (&Tsr, &Tsr),
    d2: &CCDensity2,
    store: &ScratchStore,
) -> Result<()> {
    let (doo, _) = d1;
    let (nocc, nvir) = (ix.i_vo.shape()[1], ix.i_vo.shape()[0]);
    let (o, v) = (nocc, nvir);
    let nov = o * v;

    let eris_oooo = eris.oooo.load()?;
    let eris_ooov = eris.ooov.load()?;
    let doooo = d2.doooo.load()?;
    let d_oooo = packed::symmetrize_pair(&doooo.view(), &doooo.view(), [1, 0, 2, 3]);

    // Ioo += np.einsum("jmlk, imlk -> ij", d_oooo, eris_oooo) * 2
    ix.i_oo += 2.0 * (eris_oooo.reshape((o, -1)) % d_oooo.reshape((o, -1)).t());

    // Xvo += np.einsum("iljk, ljka -> ai", d_oooo, eris_ooov) * 2
    let d_oooo = util::transpose_c(&d_oooo.view(), [0, 2, 3, 1]);
    ix.x_vo += 2.0 * (eris_ooov.reshape((-1, v)).t() % d_oooo.reshape((o, -1)).t());

    // Xvo += np.einsum("kj, kjia -> ai", doo, eris_ooov) * 4
    //      - np.einsum("kj, ikja -> ai", doo + doo.T, eris_ooov)
    let doo_sym = packed::transpose_sum(&doo.view());
    let eris_ooov_t = util::transpose_c(&eris_ooov.view(), [1, 2, 0, 3]);
    let scr_ia_1 = (doo.reshape(-1) % eris_ooov.reshape((o * o, -1))).into_shape([o, v]);
    let scr_ia_2 = (doo_sym.reshape(-1) % eris_ooov_t.reshape((o * o, -1))).into_shape([o, v]);
    ix.x_vo += (4.0_f64 * scr_ia_1 - scr_ia_2).t();

    // d_ovov = dovov + dovvo.transpose(0, 1, 3, 2), then symmetric in (ia) <-> (jb)
    let dovov = d2.dovov.load()?;
    let dovvo = d2.dovvo.load()?;
    let d_ovov = packed::symmetrize_pair(&dovov.view(), &dovvo.view(), [0, 1, 3, 2]).into_shape([nov, nov]);
    let d_ovov = packed::transpose_sum(&d_ovov.view()).into_shape([o, v, o, v]);

    // Ivo += np.einsum("jbka, jbki -> ai", d_ovov, eris_ovoo)
    let eris_ovoo = eris.ovoo.load()?;
    ix.i_vo += d_ovov.reshape((-1, v)).t() % eris_ovoo.reshape((-1, o));

    // Ioo += np.einsum("jakb, iakb -> ij", d_ovov, eris_ovov)
    // Ivv += np.einsum("jcib, jcia -> ab", d_ovov, eris_ovov)
    let eris_ovov = eris.ovov.load()?;
    ix.i_oo += eris_ovov.reshape((o, -1)) % d_ovov.reshape((o, -1)).t();
    ix.i_vv += eris_ovov.reshape((-1, v)).t() % d_ovov.reshape((-1, v));

    store.write_dataset("dovvo", &d_ovov.transpose([0, 1, 3, 2]))?;
    Ok(())
}

fn ix_pass1(
    ix: &mut IXIntermediates,
    eris: &CCERIs,
    dvv: &Tsr,
    d2: &CCDensity2,
    flags: &GradFlags,
    store: &ScratchStore,
) -> Result<()> {
    let (nocc, nvir) = (ix.i_vo.shape()[1], ix.i_vo.shape()[0]);
    let (o, v) = (nocc, nvir);
    let vp = packed::npair(nvir);
    let device = dvv.device().clone();

    let unit = (2.5 * v.pow(3) as f64).max((2 * v.pow(3) + o * v * v) as f64);
    let blksize = blocking::resolve_blksize(flags, unit, BLKMIN);
    let iobuflen = flags.iobuflen.unwrap_or(((256e6 / 8.0 / (blksize * v).max(1) as f64) as usize).max(1));
    debug!("IX pass 1: block size = {blksize}, nocc = {nocc} in {} blocks", nocc.div_ceil(blksize));

    let dvv_sym = packed::transpose_sum(&dvv.view());
    let fswap_dovvo = store.open_dataset("dovvo")?;

    for (istep, (p0, p1)) in prange(0, nocc, blksize).enumerate() {
        let nb = p1 - p0;
        let d_ooov = d2.dooov.rows(p0, p1)?;
        let eris_oooo = eris.oooo.rows(p0, p1)?;
        let eris_ooov = eris.ooov.rows(p0, p1)?;

        // Ivv += np.einsum("ijkb, ijka -> ab", d_ooov, eris_ooov)
        // Ivo += np.einsum("jlka, jlki -> ai", d_ooov, eris_oooo)
        ix.i_vv += eris_ooov.reshape((-1, v)).t() % d_ooov.reshape((-1, v));
        ix.i_vo += d_ooov.reshape((-1, v)).t() % eris_oooo.reshape((-1, o));

        // Ioo += np.einsum("klja, klia -> ij", d_ooov, eris_ooov)
        // Xvo += np.einsum("kjib, kjba -> ai", d_ooov, eris_oovv)
        let eris_oovv = eris.oovv.rows(p0, p1)?;
        let eris_oovo = util::transpose_c(&eris_ooov.view(), [0, 1, 3, 2]);
        let scr = util::transpose_c(&d_ooov.view(), [0, 1, 3, 2]);
        ix.i_oo += eris_oovo.reshape((-1, o)).t() % scr.reshape((-1, o));
        ix.x_vo += eris_oovv.reshape((-1, v)).t() % scr.reshape((-1, o));

        // Ioo += np.einsum("ljka, lika -> ij", d_ooov, eris_ooov)
        // Xvo += np.einsum("jikb, jakb -> ai", d_ooov, eris_ovov)
        let dooov_cols = d2.dooov.cols(p0, p1)?;
        let d_ooov = packed::symmetrize_pair(&d_ooov.view(), &dooov_cols.view(), [1, 0, 2, 3]);
        let eris_ovov = eris.ovov.rows(p0, p1)?;
        for i in 0..nb {
            ix.i_oo += eris_ooov.i(i).reshape((o, -1)) % d_ooov.i(i).reshape((o, -1)).t();
            ix.x_vo += eris_ovov.i(i).reshape((v, -1)) % d_ooov.i(i).reshape((o, -1)).t();
        }

        // Ioo += np.einsum("kjba, kiba -> ij", d_oovv, eris_oovv)
        // Ivv += np.einsum("ijcb, ijca -> ab", d_oovv, eris_oovv)
        // Ivo += np.einsum("kjba, kjib -> ai", d_oovv, eris_ooov)
        let doovv_rows = d2.doovv.rows(p0, p1)?;
        let doovv_cols = d2.doovv.cols(p0, p1)?;
        let d_oovv = packed::symmetrize_pair(&doovv_rows.view(), &doovv_cols.view(), [1, 0, 3, 2]);
        for i in 0..nb {
            ix.i_oo += eris_oovv.i(i).reshape((o, -1)) % d_oovv.i(i).reshape((o, -1)).t();
        }
        ix.i_vv += eris_oovv.reshape((-1, v)).t() % d_oovv.reshape((-1, v));
        ix.i_vo += d_oovv.reshape((-1, v)).t() % eris_oovo.reshape((-1, o));
        let d_oovv = packed::precontract(&d_oovv.view());

        // Ivo += np.einsum("jadc, jidc -> ai", d_ovvv, eris_oovv)
        let d_ovvv = d2.dovvv.rows(p0, p1)?;
        for i in 0..nb {
            ix.i_vo += d_ovvv.i(i).reshape((v, -1)) % eris_oovv.i(i).reshape((o, -1)).t();
        }

        // lower triangle of (d_ovvv + d_ovvv.transpose(0, 1, 3, 2))
        let c_ovvv = packed::precontract(&d_ovvv.view()).into_shape([nb * v, vp]);
        store.transpose_to_group("c_vvov", istep, &c_ovvv.view(), iobuflen)?;
        let eris_ovx = eris.ovvv.rows(p0, p1)?.into_shape([nb * v, vp]);
        store.transpose_to_group("e_vvov", istep, &eris_ovx.view(), iobuflen)?;

        // Xvo += np.einsum("jibc, jabc -> ai", d_oovv, eris_ovvv)
        // Ivv += np.einsum("ibdc, iadc -> ab", d_ovvv, eris_ovvv)
        for i in 0..nb {
            let eris_avx = eris_ovx.i(i * v..(i + 1) * v);
            ix.x_vo += &eris_avx % d_oovv.i(i).t();
            ix.i_vv += &eris_avx % c_ovvv.i(i * v..(i + 1) * v).t();
        }

        // Ivo += np.einsum("abjc, ibjc -> ai", d_ovvv, eris_ovov)
        let d_ovvv = packed::sum021(&d_ovvv.view());
        let eris_ovvo = util::transpose_c(&eris_ovov.view(), [0, 1, 3, 2]);
        ix.i_vo += d_ovvv.reshape((-1, v)).t() % eris_ovvo.reshape((-1, o));

        // Ivv += np.einsum("icdb, icda -> ab", d_ovvv, eris_ovvv)
        let eris_ovvv = packed::unpack_tril(&eris_ovx.view()).into_shape([nb, v, v, v]);
        ix.i_vv += eris_ovvv.reshape((-1, v)).t() % d_ovvv.reshape((-1, v));

        // Xvo[:, p0:p1] += np.einsum("cb, iacb -> ai", dvv, eris_ovvv) * 4
        //                - np.einsum("cb, icba -> ai", dvv + dvv.T, eris_ovvv)
        let eris_vvov = util::transpose_c(&eris_ovvv.view(), [1, 2, 0, 3]);
        let scr_ia_1 = (eris_ovvv.reshape((nb * v, -1)) % dvv.reshape(-1)).into_shape([nb, v]);
        let scr_ia_2 = (dvv_sym.reshape(-1) % eris_vvov.reshape((v * v, -1))).into_shape([nb, v]);
        *&mut ix.x_vo.i_mut((.., p0..p1)) += (4.0_f64 * scr_ia_1 - scr_ia_2).t();

        // Xvo += np.einsum("jbic, jbca -> ai", d_ovov, eris_ovvv)
        let d_ovvo = fswap_dovvo.read_rows(p0, p1, &device)?;
        ix.x_vo += eris_ovvv.reshape((-1, v)).t() % d_ovvo.reshape((-1, o));
    }
    Ok(())
}

fn ix_pass2(
    ix: &mut IXIntermediates,
    eris: &CCERIs,
    d2: &CCDensity2,
    flags: &GradFlags,
    store: &ScratchStore,
) -> Result<()> {
    let (nocc, nvir) = (ix.i_vo.shape()[1], ix.i_vo.shape()[0]);
    let (o, v) = (nocc, nvir);
    let vp = packed::npair(nvir);
    let device = ix.i_vo.device().clone();

    let unit = (o * v * v) as f64 + 2.5 * v.pow(3) as f64;
    let blksize = blocking::resolve_blksize(flags, unit, BLKMIN);
    debug!("IX pass 2: block size = {blksize}, nvir = {nvir} in {} blocks", nvir.div_ceil(blksize));

    let c_vvov = store.group("c_vvov")?;
    let e_vvov = store.group("e_vvov")?;
    for (p0, p1) in prange(0, nvir, blksize) {
        let (off0, off1) = (packed::npair(p0), packed::npair(p1));
        let npb = off1 - off0;

        // dvvvv rows of diagonal pairs carry half weight
        let mut d_vvvv = util::to_c_vec(&d2.dvvvv.rows(off0, off1)?.view());
        for i in p0..p1 {
            let row = packed::pair_index(i, i) - off0;
            d_vvvv[row * vp..(row + 1) * vp].iter_mut().for_each(|x| *x *= 0.5);
        }
        let d_vvvv = 4.0_f64 * util::asarray_c(d_vvvv, &[npb, vp], &device);
        let d_vvvv = packed::unpack_tril(&d_vvvv.view());
        let eris_vvvv = packed::unpack_tril(&eris.vvvv.rows(off0, off1)?.view());

        // Ivv += np.einsum("decb, deca -> ab", d_vvvv, eris_vvvv) * 2
        ix.i_vv += 2.0 * (eris_vvvv.reshape((-1, v)).t() % d_vvvv.reshape((-1, v)));

        // Xvo += np.einsum("dbic, dbca -> ai", d_vvov, eris_vvvv)
        let d_vvov = c_vvov.load_rows(off0, off1, &device)?.into_shape([npb, o, v]);
        let d_vvvo = util::transpose_c(&d_vvov.view(), [0, 2, 1]);
        ix.x_vo += eris_vvvv.reshape((-1, v)).t() % d_vvvo.reshape((-1, o));

        // Ioo += np.einsum("abjc, abci -> ij", d_vvov, eris_vvvo)
        // Ivo += np.einsum("dbca, dbci -> ai", d_vvvv, eris_vvvo) * 2
        let eris_vvov = e_vvov.load_rows(off0, off1, &device)?.into_shape([npb, o, v]);
        let eris_vvvo = util::transpose_c(&eris_vvov.view(), [0, 2, 1]);
        ix.i_vo += 2.0 * (d_vvvv.reshape((-1, v)).t() % eris_vvvo.reshape((-1, o)));
        ix.i_oo += eris_vvvo.reshape((-1, o)).t() % d_vvvo.reshape((-1, o));
    }
    Ok(())
}
