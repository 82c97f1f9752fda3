pub(crate) use crate::utils::krate;
pub use darling::{FromAttributes, FromMeta, util::Flag};
pub use heck::ToSnakeCase;
pub use itertools::Itertools;
pub use proc_macro2::{Span, TokenStream};
pub use quote::quote;
pub use syn::{
    Data, DeriveInput, Error, Expr, Field, Fields, FieldsNamed, GenericArgument, Ident, Lit,
    LitStr, PathArguments, Result, Type, parse2,
};
