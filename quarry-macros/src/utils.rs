use crate::prelude::*;
use proc_macro_crate::{FoundCrate, crate_name};

pub fn named_fields(ident: &Ident, data: Data) -> Result<FieldsNamed> {
    match data {
        Data::Struct(data) => match data.fields {
            Fields::Named(fields) => Ok(fields),
            fields => Err(Error::new_spanned(
                fields,
                "a model must have named fields",
            )),
        },
        _ => Err(Error::new_spanned(ident, "a model must be a struct")),
    }
}

/// Value of `#[serde(rename = "...")]`, ignoring every other serde key.
pub fn serde_rename(field: &Field) -> Result<Option<String>> {
    let mut rename = None;

    for attribute in field.attrs.iter().filter(|attr| attr.path().is_ident("serde")) {
        attribute.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                rename = Some(meta.value()?.parse::<LitStr>()?.value());
            } else if meta.input.peek(syn::Token![=]) {
                meta.value()?.parse::<Expr>()?;
            } else if meta.input.peek(syn::token::Paren) {
                meta.parse_nested_meta(|nested| {
                    if nested.input.peek(syn::Token![=]) {
                        nested.value()?.parse::<Expr>()?;
                    }
                    Ok(())
                })?;
            }
            Ok(())
        })?;
    }

    Ok(rename)
}

/// Last path segment of `ty` with its generic arguments, if `ty` is a plain path.
pub fn last_segment(ty: &Type) -> Option<(&Ident, Vec<&Type>)> {
    let Type::Path(type_path) = ty else {
        return None;
    };
    if type_path.qself.is_some() {
        return None;
    }

    let segment = type_path.path.segments.last()?;

    let arguments = match &segment.arguments {
        PathArguments::AngleBracketed(arguments) => arguments
            .args
            .iter()
            .filter_map(|argument| match argument {
                GenericArgument::Type(ty) => Some(ty),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Some((&segment.ident, arguments))
}

pub fn krate() -> TokenStream {
    match crate_name("quarry") {
        Ok(FoundCrate::Name(name)) => {
            let name = Ident::new(&name, Span::call_site());
            quote! { ::#name }
        }
        Ok(FoundCrate::Itself) | Err(_) => quote! { ::quarry },
    }
}
