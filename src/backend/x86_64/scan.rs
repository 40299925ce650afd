//! Pass 1: scan input relocations, classifying each one into PLT, GOT,
//! dynamic-relocation, and copy-relocation demands.
//!
//! Scanning is idempotent per symbol: every allocation is guarded by the
//! symbol's (or object's) recorded PLT/GOT offset, so seeing the same
//! relocation again allocates nothing new.

use crate::backend::elf::SHT_REL;
use crate::backend::linker_common::{
    Elf64Rela, InputObject, OutputSectionInfo, SymbolId, SymbolTable,
};
use crate::backend::x86_64::dynrel::RelocPlace;
use crate::backend::x86_64::got::GotEntryKind;
use crate::backend::x86_64::reloc::{dynamic_loader_supports, reference_flags, RelocType};
use crate::backend::x86_64::tls::{optimize_tls_reloc, TlsOptimization};
use crate::backend::x86_64::Target;
use crate::common::error::DiagnosticEngine;

/// Per-object scan state. The non-PIC flag throttles the "recompile with
/// -fPIC" report to one per object.
#[derive(Debug, Default)]
pub struct ScanState {
    issued_non_pic_error: bool,
}

impl ScanState {
    pub fn new() -> Self {
        ScanState { issued_non_pic_error: false }
    }
}

/// Scan one relocation section of one input object.
pub fn scan_relocs(
    target: &mut Target,
    symtab: &mut SymbolTable,
    object: &mut InputObject,
    obj: usize,
    data_shndx: usize,
    sh_type: u32,
    relocs: &[Elf64Rela],
    output_section: &OutputSectionInfo,
    state: &mut ScanState,
    diag: &mut DiagnosticEngine,
) -> Result<(), String> {
    if sh_type == SHT_REL {
        diag.error_object(&object.name, "unsupported REL reloc section");
        return Ok(());
    }

    // Offset of this input section inside its output section; relocation
    // places are recorded output-section-relative.
    let section_offset = object.output_section_of(data_shndx).map(|(_, off)| off).unwrap_or(0);

    for rela in relocs {
        let r_type = match RelocType::from_u32(rela.rela_type) {
            Some(r_type) => r_type,
            None => {
                diag.error_object(
                    &object.name,
                    format!("unsupported reloc {} against local symbol", rela.rela_type),
                );
                continue;
            }
        };
        let place = RelocPlace::Section {
            section: output_section.id,
            offset: section_offset + rela.offset,
        };
        match object.global_id(rela.sym_idx) {
            Some(sym) => {
                scan_global(target, symtab, object, obj, rela, r_type, place, output_section, state, diag)?;
            }
            None => {
                scan_local(target, symtab, object, obj, rela, r_type, place, state, diag)?;
            }
        }
    }
    Ok(())
}

/// Whether a relocation of the given type against an STT_GNU_IFUNC symbol
/// demands a PLT entry. TLS against an ifunc is not a meaningful
/// combination and is reported.
fn reloc_needs_plt_for_ifunc(
    object_name: &str,
    r_type: RelocType,
    diag: &mut DiagnosticEngine,
) -> bool {
    let flags = reference_flags(r_type);
    if flags & crate::backend::linker_common::reference::TLS != 0 {
        diag.error_object(
            object_name,
            format!("unsupported TLS reloc {} for IFUNC symbol", r_type as u32),
        );
    }
    flags != 0
}

/// The dynamic loader handles only a fixed relocation set; anything else
/// required in a position-independent output means the input was not
/// compiled for PIC. Reported once per object.
fn check_non_pic(
    state: &mut ScanState,
    object_name: &str,
    r_type: RelocType,
    diag: &mut DiagnosticEngine,
) {
    if dynamic_loader_supports(r_type) {
        return;
    }
    if state.issued_non_pic_error {
        return;
    }
    state.issued_non_pic_error = true;
    diag.error_object(object_name, "requires unsupported dynamic reloc; recompile with -fPIC");
}

fn unsupported_reloc_local(object_name: &str, r_type: RelocType, diag: &mut DiagnosticEngine) {
    diag.error_object(
        object_name,
        format!("unsupported reloc {} against local symbol", r_type as u32),
    );
}

fn unsupported_reloc_global(
    object_name: &str,
    r_type: RelocType,
    symbol: &str,
    diag: &mut DiagnosticEngine,
) {
    diag.error_object(
        object_name,
        format!("unsupported reloc {} against global symbol {}", r_type as u32, symbol),
    );
}

// ── Local symbols ────────────────────────────────────────────────────────

fn scan_local(
    target: &mut Target,
    symtab: &mut SymbolTable,
    object: &mut InputObject,
    obj: usize,
    rela: &Elf64Rela,
    r_type: RelocType,
    place: RelocPlace,
    state: &mut ScanState,
    diag: &mut DiagnosticEngine,
) -> Result<(), String> {
    let r_sym = rela.sym_idx;
    let lsym = match object.local(r_sym) {
        Some(lsym) => lsym.clone(),
        None => return Ok(()),
    };

    // A local STT_GNU_IFUNC symbol may require a PLT entry.
    if lsym.is_ifunc() && reloc_needs_plt_for_ifunc(&object.name, r_type, diag) {
        target.make_local_ifunc_plt_entry(symtab, object, obj, r_sym)?;
    }

    let position_independent = target.options.output_kind.is_position_independent();
    let output_is_shared = target.options.output_kind.is_shared();

    match r_type {
        RelocType::None | RelocType::GnuVtInherit | RelocType::GnuVtEntry => {}

        RelocType::Abs64 => {
            // In a position-independent output the location must be flagged
            // RELATIVE so the loader can rebase it; the link-time value is
            // still applied in place.
            if position_independent {
                target
                    .rela_dyn()
                    .add_local_relative(obj, r_sym, RelocType::Relative, place, rela.addend);
            }
        }

        RelocType::Abs32 | RelocType::Abs32S | RelocType::Abs16 | RelocType::Abs8 => {
            // RELATIVE is 64-bit only, so narrower absolute relocations keep
            // their own type dynamically, which the loader may not support.
            if position_independent {
                check_non_pic(state, &object.name, r_type, diag);
                if !lsym.is_section() {
                    target.rela_dyn().add_local(obj, r_sym, r_type, place, rela.addend);
                } else if !lsym.shndx_ordinary {
                    diag.error_object(
                        &object.name,
                        format!("section symbol {} has bad shndx {}", r_sym, lsym.shndx),
                    );
                } else {
                    match object.output_section_of(lsym.shndx as usize) {
                        Some((out_section, out_offset)) => {
                            target.rela_dyn().add_local_section(
                                out_section,
                                r_type,
                                place,
                                rela.addend + out_offset as i64,
                            );
                        }
                        None => diag.error_object(
                            &object.name,
                            format!("section symbol {} has bad shndx {}", r_sym, lsym.shndx),
                        ),
                    }
                }
            }
        }

        RelocType::Pc64 | RelocType::Pc32 | RelocType::Pc16 | RelocType::Pc8 => {}

        // A PLT32 against a local symbol resolves like PC32.
        RelocType::Plt32 => {}

        RelocType::GotPc32 | RelocType::GotOff64 | RelocType::GotPc64 | RelocType::PltOff64 => {
            // These only need the GOT base to exist. PLTOFF64 against a
            // local symbol needs no PLT either.
            target.ensure_got(symtab);
        }

        RelocType::Got64
        | RelocType::Got32
        | RelocType::GotPcRel64
        | RelocType::GotPcRel
        | RelocType::GotPlt64 => {
            let (got, rela_dyn) = target.got_rela_dyn(symtab);
            // An ifunc's GOT slot holds its PLT address so function
            // pointers compare equal across shared objects.
            let is_new = if lsym.is_ifunc() {
                got.add_local_plt(object, obj, r_sym, GotEntryKind::Standard)
            } else {
                got.add_local(object, obj, r_sym, GotEntryKind::Standard)
            };
            if is_new && position_independent {
                let got_offset = object
                    .local_got_offset(r_sym, GotEntryKind::Standard.as_u32())
                    .unwrap_or(0);
                if r_type != RelocType::Got32 {
                    rela_dyn.add_local_relative(
                        obj,
                        r_sym,
                        RelocType::Relative,
                        RelocPlace::Got(got_offset),
                        0,
                    );
                } else {
                    // RELATIVE assumes a 64-bit field; a 32-bit GOT slot
                    // reference has to keep its own type.
                    check_non_pic(state, &object.name, r_type, diag);
                    if lsym.is_section() {
                        diag.error_object(
                            &object.name,
                            format!("unsupported reloc {} against local symbol", r_type as u32),
                        );
                    } else {
                        rela_dyn.add_local(obj, r_sym, r_type, RelocPlace::Got(got_offset), 0);
                    }
                }
            }
        }

        _ if r_type.is_outstanding_dynamic() => {
            diag.error_object(
                &object.name,
                format!("unexpected reloc {} in object file", r_type as u32),
            );
        }

        _ if r_type.is_initial_tls() => {
            let optimized = optimize_tls_reloc(&target.options, !output_is_shared, r_type);
            match r_type {
                RelocType::TlsGd => {
                    if optimized == TlsOptimization::None {
                        if !lsym.shndx_ordinary {
                            diag.error_object(
                                &object.name,
                                format!("local symbol {} has bad shndx {}", r_sym, lsym.shndx),
                            );
                        } else {
                            // A pair of GOT entries: the loader fills the
                            // module index, the dtv offset is link-time.
                            let (got, rela_dyn) = target.got_rela_dyn(symtab);
                            got.add_local_pair_with_rela(
                                object,
                                obj,
                                r_sym,
                                GotEntryKind::TlsPair,
                                rela_dyn,
                                RelocType::DtpMod64,
                            );
                        }
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_local(&object.name, r_type, diag);
                    }
                }

                RelocType::GotPc32TlsDesc => {
                    target.define_tls_base_symbol(symtab);
                    if optimized == TlsOptimization::None {
                        target.reserve_tlsdesc_entries(symtab);
                        if !object.local_has_got_offset(r_sym, GotEntryKind::TlsDesc.as_u32()) {
                            let index = target.add_tlsdesc_info(obj, r_sym);
                            let (got, rela_tlsdesc) = target.got_rela_tlsdesc(symtab);
                            got.add_tlsdesc_local_pair(object, r_sym, index, rela_tlsdesc);
                        }
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_local(&object.name, r_type, diag);
                    }
                }

                RelocType::TlsDescCall => {}

                RelocType::TlsLd => {
                    if optimized == TlsOptimization::None {
                        target.got_mod_index_entry(symtab, obj);
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_local(&object.name, r_type, diag);
                    }
                }

                RelocType::DtpOff32 | RelocType::DtpOff64 => {}

                RelocType::GotTpOff => {
                    target.set_has_static_tls();
                    if optimized == TlsOptimization::None {
                        let (got, rela_dyn) = target.got_rela_dyn(symtab);
                        got.add_local_with_rela(
                            object,
                            obj,
                            r_sym,
                            GotEntryKind::TlsOffset,
                            rela_dyn,
                            RelocType::TpOff64,
                        );
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_local(&object.name, r_type, diag);
                    }
                }

                RelocType::TpOff32 => {
                    target.set_has_static_tls();
                    if output_is_shared {
                        unsupported_reloc_local(&object.name, r_type, diag);
                    }
                }

                _ => {}
            }
        }

        _ => {
            unsupported_reloc_local(&object.name, r_type, diag);
        }
    }
    Ok(())
}

// ── Global symbols ───────────────────────────────────────────────────────

fn scan_global(
    target: &mut Target,
    symtab: &mut SymbolTable,
    object: &mut InputObject,
    obj: usize,
    rela: &Elf64Rela,
    r_type: RelocType,
    place: RelocPlace,
    output_section: &OutputSectionInfo,
    state: &mut ScanState,
    diag: &mut DiagnosticEngine,
) -> Result<(), String> {
    let sym: SymbolId = match object.global_id(rela.sym_idx) {
        Some(sym) => sym,
        None => return Ok(()),
    };

    // An STT_GNU_IFUNC symbol may require a PLT entry.
    if symtab[sym].is_ifunc() && reloc_needs_plt_for_ifunc(&object.name, r_type, diag) {
        target.make_plt_entry(symtab, sym)?;
    }

    let options = target.options.clone();
    let position_independent = options.output_kind.is_position_independent();
    let output_is_shared = options.output_kind.is_shared();

    match r_type {
        RelocType::None | RelocType::GnuVtInherit | RelocType::GnuVtEntry => {}

        RelocType::Abs64
        | RelocType::Abs32
        | RelocType::Abs32S
        | RelocType::Abs16
        | RelocType::Abs8 => {
            if symtab[sym].needs_plt_entry(&options) {
                target.make_plt_entry(symtab, sym)?;
                // A non-PC-relative reloc may be taking the function's
                // address; the dynamic symbol must then resolve to the PLT
                // entry so pointers agree across the process.
                if symtab[sym].from_dynobj && !output_is_shared {
                    symtab[sym].needs_dynsym_value = true;
                }
            }
            if symtab[sym].needs_dynamic_reloc(&options, reference_flags(r_type)) {
                if symtab[sym].may_need_copy_reloc(&options) {
                    if let RelocPlace::Section { section: _, offset } = place {
                        target.copy_relocs.save(sym, output_section.id, offset);
                    }
                } else if r_type == RelocType::Abs64
                    && symtab[sym].is_ifunc()
                    && symtab[sym].can_use_relative_reloc(false)
                    && !symtab[sym].from_dynobj
                    && !symtab[sym].is_undefined()
                    && !symtab[sym].preemptible
                {
                    // A locally defined ifunc's address in a PIE matches
                    // the address a shared library would see.
                    target.rela_dyn().add_symbolless_global_addend(
                        sym,
                        RelocType::IRelative,
                        place,
                        rela.addend,
                    );
                } else if r_type == RelocType::Abs64
                    && symtab[sym].can_use_relative_reloc(false)
                {
                    target
                        .rela_dyn()
                        .add_global_relative(sym, RelocType::Relative, place, rela.addend);
                } else {
                    check_non_pic(state, &object.name, r_type, diag);
                    target.rela_dyn().add_global(sym, r_type, place, rela.addend);
                }
            }
        }

        RelocType::Pc64 | RelocType::Pc32 | RelocType::Pc16 | RelocType::Pc8 => {
            if symtab[sym].needs_plt_entry(&options) {
                target.make_plt_entry(symtab, sym)?;
            }
            if symtab[sym].needs_dynamic_reloc(&options, reference_flags(r_type)) {
                if symtab[sym].may_need_copy_reloc(&options) {
                    if let RelocPlace::Section { section: _, offset } = place {
                        target.copy_relocs.save(sym, output_section.id, offset);
                    }
                } else {
                    check_non_pic(state, &object.name, r_type, diag);
                    target.rela_dyn().add_global(sym, r_type, place, rela.addend);
                }
            }
        }

        RelocType::Got64
        | RelocType::Got32
        | RelocType::GotPcRel64
        | RelocType::GotPcRel
        | RelocType::GotPlt64 => {
            target.ensure_got(symtab);
            if symtab[sym].final_value_known {
                let (got, _) = target.got_rela_dyn(symtab);
                if symtab[sym].is_ifunc() {
                    got.add_global_plt(symtab, sym, GotEntryKind::Standard);
                } else {
                    got.add_global(symtab, sym, GotEntryKind::Standard);
                }
            } else if symtab[sym].from_dynobj
                || symtab[sym].is_undefined()
                || symtab[sym].preemptible
                || (symtab[sym].is_ifunc() && position_independent)
            {
                let (got, rela_dyn) = target.got_rela_dyn(symtab);
                got.add_global_with_rela(
                    symtab,
                    sym,
                    GotEntryKind::Standard,
                    rela_dyn,
                    RelocType::GlobDat,
                );
            } else {
                let (got, rela_dyn) = target.got_rela_dyn(symtab);
                let is_new = if symtab[sym].is_ifunc() {
                    let is_new = got.add_global_plt(symtab, sym, GotEntryKind::Standard);
                    // The dynamic symbol resolves to the PLT address so
                    // function pointers compare correctly.
                    if symtab[sym].from_dynobj && !output_is_shared {
                        symtab[sym].needs_dynsym_value = true;
                    }
                    is_new
                } else {
                    got.add_global(symtab, sym, GotEntryKind::Standard)
                };
                if is_new {
                    if let Some(got_offset) =
                        symtab[sym].got_offset(GotEntryKind::Standard.as_u32())
                    {
                        rela_dyn.add_global_relative(
                            sym,
                            RelocType::Relative,
                            RelocPlace::Got(got_offset),
                            0,
                        );
                    }
                }
            }
            // GOTPLT64 also wants the PLT entry itself unless the value is
            // fully known.
            if r_type == RelocType::GotPlt64 && !symtab[sym].final_value_known {
                target.make_plt_entry(symtab, sym)?;
            }
        }

        RelocType::Plt32 => {
            // Fully resolved: plain PC32. Defined and non-preemptible in
            // this output: the call binds locally, no PLT either.
            if symtab[sym].final_value_known {
                return Ok(());
            }
            if symtab[sym].defined && !symtab[sym].from_dynobj && !symtab[sym].preemptible {
                return Ok(());
            }
            target.make_plt_entry(symtab, sym)?;
        }

        RelocType::GotPc32 | RelocType::GotOff64 | RelocType::GotPc64 | RelocType::PltOff64 => {
            target.ensure_got(symtab);
            if r_type == RelocType::PltOff64 && !symtab[sym].final_value_known {
                target.make_plt_entry(symtab, sym)?;
            }
        }

        _ if r_type.is_outstanding_dynamic() => {
            diag.error_object(
                &object.name,
                format!("unexpected reloc {} in object file", r_type as u32),
            );
        }

        _ if r_type.is_initial_tls() => {
            let is_final = symtab[sym].final_value_known;
            let optimized = optimize_tls_reloc(&options, is_final, r_type);
            match r_type {
                RelocType::TlsGd => {
                    if optimized == TlsOptimization::None {
                        let (got, rela_dyn) = target.got_rela_dyn(symtab);
                        got.add_global_pair_with_rela(
                            symtab,
                            sym,
                            GotEntryKind::TlsPair,
                            rela_dyn,
                            RelocType::DtpMod64,
                            RelocType::DtpOff64,
                        );
                    } else if optimized == TlsOptimization::ToIe {
                        let (got, rela_dyn) = target.got_rela_dyn(symtab);
                        got.add_global_with_rela(
                            symtab,
                            sym,
                            GotEntryKind::TlsOffset,
                            rela_dyn,
                            RelocType::TpOff64,
                        );
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_global(&object.name, r_type, &symtab[sym].name, diag);
                    }
                }

                RelocType::GotPc32TlsDesc => {
                    target.define_tls_base_symbol(symtab);
                    if optimized == TlsOptimization::None {
                        target.reserve_tlsdesc_entries(symtab);
                        let (got, rela_tlsdesc) = target.got_rela_tlsdesc(symtab);
                        got.add_tlsdesc_global_pair(symtab, sym, rela_tlsdesc);
                    } else if optimized == TlsOptimization::ToIe {
                        let (got, rela_dyn) = target.got_rela_dyn(symtab);
                        got.add_global_with_rela(
                            symtab,
                            sym,
                            GotEntryKind::TlsOffset,
                            rela_dyn,
                            RelocType::TpOff64,
                        );
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_global(&object.name, r_type, &symtab[sym].name, diag);
                    }
                }

                RelocType::TlsDescCall => {}

                RelocType::TlsLd => {
                    if optimized == TlsOptimization::None {
                        target.got_mod_index_entry(symtab, obj);
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_global(&object.name, r_type, &symtab[sym].name, diag);
                    }
                }

                RelocType::DtpOff32 | RelocType::DtpOff64 => {}

                RelocType::GotTpOff => {
                    target.set_has_static_tls();
                    if optimized == TlsOptimization::None {
                        let (got, rela_dyn) = target.got_rela_dyn(symtab);
                        got.add_global_with_rela(
                            symtab,
                            sym,
                            GotEntryKind::TlsOffset,
                            rela_dyn,
                            RelocType::TpOff64,
                        );
                    } else if optimized != TlsOptimization::ToLe {
                        unsupported_reloc_global(&object.name, r_type, &symtab[sym].name, diag);
                    }
                }

                RelocType::TpOff32 => {
                    target.set_has_static_tls();
                    if output_is_shared {
                        unsupported_reloc_global(&object.name, r_type, &symtab[sym].name, diag);
                    }
                }

                _ => {}
            }
        }

        _ => {
            unsupported_reloc_global(&object.name, r_type, &symtab[sym].name, diag);
        }
    }

    Ok(())
}

// ── Garbage-collection signal ────────────────────────────────────────────

/// Which symbol a relocation references, for the mark phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcSymbol {
    Local(u32),
    Global(SymbolId),
}

/// One "section S references symbol X with reference kind K" fact.
#[derive(Debug, Clone, Copy)]
pub struct GcRef {
    pub data_shndx: usize,
    pub sym: GcSymbol,
    pub flags: u32,
}

/// Report the symbol references of a relocation section to the garbage
/// collector's mark phase. REL sections carry nothing here and are skipped
/// without a diagnostic; the scan proper rejects them.
pub fn gc_process_relocs(
    object: &InputObject,
    data_shndx: usize,
    sh_type: u32,
    relocs: &[Elf64Rela],
    out: &mut Vec<GcRef>,
) {
    if sh_type == SHT_REL {
        return;
    }
    for rela in relocs {
        let r_type = match RelocType::from_u32(rela.rela_type) {
            Some(r_type) => r_type,
            None => continue,
        };
        let flags = reference_flags(r_type);
        if flags == 0 {
            continue;
        }
        let sym = match object.global_id(rela.sym_idx) {
            Some(id) => GcSymbol::Global(id),
            None => GcSymbol::Local(rela.sym_idx),
        };
        out.push(GcRef { data_shndx, sym, flags });
    }
}
