use crate::{
    prelude::*,
    utils::{last_segment, named_fields, serde_rename},
};

#[derive(FromMeta)]
struct DiscriminatorAttribute {
    key: String,
    value: String,
}

#[derive(FromAttributes)]
#[darling(attributes(model))]
struct Attributes {
    collection: Option<String>,
    discriminator: Option<DiscriminatorAttribute>,
    strict: Option<bool>,
    strict_query: Option<bool>,
}

#[derive(FromAttributes)]
#[darling(attributes(model))]
struct FieldAttributes {
    #[darling(rename = "default")]
    default_value: Option<Lit>,
    required: Flag,
    min: Option<Expr>,
    max: Option<Expr>,
    hidden: Flag,
    reference: Option<String>,
}

pub fn derive_model(item: TokenStream) -> Result<TokenStream> {
    let input = parse2::<DeriveInput>(item)?;

    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "a model cannot have generic parameters",
        ));
    }

    let attributes = Attributes::from_attributes(&input.attrs)?;

    let fields = named_fields(&input.ident, input.data)?
        .named
        .iter()
        .map(|field| -> Result<FieldConfig> {
            let path = match serde_rename(field)? {
                Some(rename) => rename,
                None => field
                    .ident
                    .as_ref()
                    .map(ToString::to_string)
                    .ok_or_else(|| Error::new_spanned(field, "expected named field"))?,
            };

            Ok(FieldConfig {
                path,
                ty: field.ty.clone(),
                attributes: FieldAttributes::from_attributes(&field.attrs)?,
            })
        })
        .try_collect::<_, Vec<_>, _>()?;

    Ok(build(&input.ident, &attributes, &fields))
}

struct FieldConfig {
    path: String,
    ty: Type,
    attributes: FieldAttributes,
}

/// `FieldType` expression for a Rust type. `Option` is transparent.
fn field_type(krate: &TokenStream, ty: &Type) -> TokenStream {
    if let Type::Reference(reference) = ty {
        return field_type(krate, &reference.elem);
    }

    let Some((ident, arguments)) = last_segment(ty) else {
        return quote! { #krate::FieldType::Mixed };
    };

    match (ident.to_string().as_str(), arguments.as_slice()) {
        ("Option" | "Box", [inner]) => field_type(krate, inner),
        ("Vec", [inner]) => {
            let inner = field_type(krate, inner);
            quote! { #krate::FieldType::array(#inner) }
        }
        ("String" | "str", []) => quote! { #krate::FieldType::String },
        (
            "i8" | "i16" | "i32" | "i64" | "isize" | "u8" | "u16" | "u32" | "u64" | "usize"
            | "f32" | "f64",
            [],
        ) => quote! { #krate::FieldType::Number },
        ("bool", []) => quote! { #krate::FieldType::Boolean },
        ("ObjectId", []) => quote! { #krate::FieldType::ObjectId },
        ("DateTime", _) => quote! { #krate::FieldType::Date },
        _ => quote! { #krate::FieldType::Mixed },
    }
}

fn build(ident: &Ident, attributes: &Attributes, fields: &[FieldConfig]) -> TokenStream {
    let krate = krate();

    let model_name = LitStr::new(&ident.to_string(), Span::call_site());

    let collection_name = attributes.collection.clone().unwrap_or_else(|| {
        let snake_case = ident.to_string().to_snake_case();
        snake_case
            .strip_suffix("_model")
            .map_or_else(|| snake_case.clone(), ToOwned::to_owned)
    });
    let collection_name = LitStr::new(&collection_name, Span::call_site());

    let paths = fields.iter().map(|field| {
        let path = LitStr::new(&field.path, Span::call_site());
        let ty = field_type(&krate, &field.ty);
        let attributes = &field.attributes;

        let required = attributes
            .required
            .is_present()
            .then(|| quote! { .required() });
        let min = attributes
            .min
            .as_ref()
            .map(|min| quote! { .min(::std::convert::Into::<f64>::into(#min)) });
        let max = attributes
            .max
            .as_ref()
            .map(|max| quote! { .max(::std::convert::Into::<f64>::into(#max)) });
        let default_value = attributes
            .default_value
            .as_ref()
            .map(|value| quote! { .default_value(#value) });
        let hidden = attributes.hidden.is_present().then(|| quote! { .hidden() });
        let reference = attributes
            .reference
            .as_ref()
            .map(|collection| quote! { .reference(#collection) });

        quote! {
            .with_path(
                #path,
                #krate::SchemaPath::new(#ty)
                    #required
                    #min
                    #max
                    #default_value
                    #hidden
                    #reference
            )
        }
    });

    let discriminator = attributes.discriminator.as_ref().map(|discriminator| {
        let key = &discriminator.key;
        let value = &discriminator.value;
        quote! { .discriminator(#key, #value) }
    });

    let strict = attributes
        .strict
        .map(|strict| quote! { .with_strict(#strict) });
    let strict_query = attributes
        .strict_query
        .map(|strict_query| quote! { .with_strict_query(#strict_query) });

    quote! {
        impl #krate::Model for #ident {
            const COLLECTION_NAME: &'static str = #collection_name;

            fn schema() -> &'static #krate::Schema {
                static SCHEMA: ::std::sync::LazyLock<#krate::Schema> =
                    ::std::sync::LazyLock::new(|| {
                        #krate::Schema::new(#model_name)
                            #( #paths )*
                            #discriminator
                            #strict
                            #strict_query
                    });

                &SCHEMA
            }
        }
    }
}
