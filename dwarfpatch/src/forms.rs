//! Attribute form dispatch shared by the info walker and the line-program
//! rewriter.

use gimli::constants;

use crate::error::{EditError, EditErrorKind};
use crate::reader::Reader;

/// Resolves `DW_FORM_indirect` chains down to the real form.
pub(crate) fn resolve_indirect(r: &mut Reader<'_>, mut form: u64) -> Result<u64, EditError> {
    while form == u64::from(constants::DW_FORM_indirect.0) {
        form = r.read_uleb128()?;
    }
    Ok(form)
}

/// Consumes the value of an attribute with the given form.
///
/// Handles every DWARF 2-5 form the editor does not interpret itself;
/// unknown forms are fatal since their size cannot be known.
pub(crate) fn skip_form(
    r: &mut Reader<'_>,
    form: u64,
    version: u16,
    address_size: u8,
) -> Result<(), EditError> {
    use constants::*;

    let form = resolve_indirect(r, form)?;
    match DwForm(form as u16) {
        DW_FORM_addr => r.skip(usize::from(address_size)),
        DW_FORM_ref_addr => {
            // In DWARF 2 this was the size of an address.
            if version == 2 {
                r.skip(usize::from(address_size))
            } else {
                r.skip(4)
            }
        }
        DW_FORM_flag_present | DW_FORM_implicit_const => Ok(()),
        DW_FORM_data1 | DW_FORM_flag | DW_FORM_ref1 | DW_FORM_strx1 | DW_FORM_addrx1 => r.skip(1),
        DW_FORM_data2 | DW_FORM_ref2 | DW_FORM_strx2 | DW_FORM_addrx2 => r.skip(2),
        DW_FORM_strx3 | DW_FORM_addrx3 => r.skip(3),
        DW_FORM_data4
        | DW_FORM_ref4
        | DW_FORM_strx4
        | DW_FORM_addrx4
        | DW_FORM_sec_offset
        | DW_FORM_strp
        | DW_FORM_line_strp
        | DW_FORM_strp_sup
        | DW_FORM_ref_sup4
        | DW_FORM_GNU_ref_alt
        | DW_FORM_GNU_strp_alt => r.skip(4),
        DW_FORM_data8 | DW_FORM_ref8 | DW_FORM_ref_sig8 | DW_FORM_ref_sup8 => r.skip(8),
        DW_FORM_data16 => r.skip(16),
        DW_FORM_sdata => r.read_sleb128().map(|_| ()),
        DW_FORM_udata | DW_FORM_ref_udata | DW_FORM_strx | DW_FORM_addrx | DW_FORM_loclistx
        | DW_FORM_rnglistx | DW_FORM_GNU_addr_index | DW_FORM_GNU_str_index => {
            r.read_uleb128().map(|_| ())
        }
        DW_FORM_string => r.read_cstr().map(|_| ()),
        DW_FORM_block1 => {
            let len = r.read_u8()?;
            r.skip(usize::from(len))
        }
        DW_FORM_block2 => {
            let len = r.read_u16()?;
            r.skip(usize::from(len))
        }
        DW_FORM_block4 => {
            let len = r.read_u32()?;
            r.skip(len as usize)
        }
        DW_FORM_block | DW_FORM_exprloc => {
            let len = r.read_uleb128()?;
            r.skip(len as usize)
        }
        _ => Err(EditErrorKind::UnknownForm(form).into()),
    }
}
