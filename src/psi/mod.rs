pub mod assembler;
pub mod cat;
pub mod desc;
pub mod pat;
pub mod pmt;
pub mod section;

pub use assembler::{send_section, PsiBuffer};
pub use cat::parse_cat;
pub use desc::CaDescriptor;
pub use pat::parse_pat;
pub use pmt::{parse_pmt, rewrite_pmt};
