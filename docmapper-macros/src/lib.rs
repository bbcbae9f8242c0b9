//! Procedural macros for the docmapper project.
//!
//! `#[derive(MappedType)]` implements `docmapper::schema::MappedType` for a
//! struct with named fields. The generated schema lists every serialized
//! field under its stored name and records:
//!
//! - the codec of the field's `#[serde(with = "...")]` module, read from the
//!   module's `MARKER` constant, or the one named with
//!   `#[docmapper(codec = "name")]`, which takes precedence
//! - whether the field holds a collection (`Vec`, `VecDeque`, `HashSet`,
//!   `BTreeSet` and `LinkedList`, also inside `Option`, or an explicit
//!   `#[docmapper(collection)]`)
//! - the schema of embedded documents marked `#[docmapper(nested)]`
//!
//! The collection name defaults to the lowercased struct name and is set with
//! `#[docmapper(collection = "name")]` on the struct. Stored names follow
//! `#[serde(rename = "...")]`; fields with `#[serde(skip)]` or
//! `#[serde(flatten)]` are left out. A `with` module that is not a codec
//! module (it has no `MARKER`) is excluded with `#[docmapper(no_codec)]`.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize, MappedType)]
//! #[docmapper(collection = "orders")]
//! struct Order {
//!     #[serde(rename = "_id", with = "docmapper::codec::object_id")]
//!     id: String,
//!     #[docmapper(nested)]
//!     items: Vec<Item>,
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmapper_macros;

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    Data, DeriveInput, Expr, Fields, GenericArgument, LitStr, Path, PathArguments, Token, Type,
    meta::ParseNestedMeta, parse_macro_input, token::Paren,
};

const COLLECTION_TYPES: &[&str] = &["Vec", "VecDeque", "HashSet", "BTreeSet", "LinkedList"];

#[proc_macro_derive(MappedType, attributes(docmapper))]
pub fn derive_mapped_type(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(output) => output.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let ident = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let collection = parse_struct_attrs(input)?
        .unwrap_or_else(|| ident.to_string().to_lowercase());

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(ident, "MappedType can only be derived for structs"));
    };
    let Fields::Named(named) = &data.fields else {
        return Err(syn::Error::new_spanned(ident, "MappedType requires named fields"));
    };

    let mut fields = Vec::new();
    for field in &named.named {
        if let Some(info) = parse_field(field)? {
            fields.push(field_schema(&info));
        }
    }

    Ok(quote! {
        impl #impl_generics ::docmapper::schema::MappedType for #ident #ty_generics #where_clause {
            fn collection_name() -> &'static str {
                #collection
            }

            fn schema() -> ::docmapper::schema::Schema {
                ::docmapper::schema::Schema::builder()
                    #(#fields)*
                    .build()
            }
        }
    })
}

/// Parses the struct-level `#[docmapper(collection = "...")]`.
fn parse_struct_attrs(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut collection = None;

    for attr in &input.attrs {
        if !attr.path().is_ident("docmapper") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("collection") {
                let value: LitStr = meta.value()?.parse()?;
                collection = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported docmapper attribute"))
            }
        })?;
    }

    Ok(collection)
}

/// Where a field's codec marker comes from.
enum CodecSource {
    Named(LitStr),
    Module(Path),
}

struct FieldInfo {
    stored_name: String,
    codec: Option<CodecSource>,
    is_collection: bool,
    nested: Option<Type>,
}

/// Reads a field's serde and docmapper attributes. Returns `None` for fields
/// that are never serialized on their own.
fn parse_field(field: &syn::Field) -> syn::Result<Option<FieldInfo>> {
    let Some(ident) = &field.ident else {
        return Err(syn::Error::new_spanned(field, "fields must be named"));
    };

    let mut stored_name = ident.to_string();
    if let Some(raw) = stored_name.strip_prefix("r#") {
        stored_name = raw.to_owned();
    }

    let mut skipped = false;
    let mut codec = None;
    let mut with_module = None;
    let mut no_codec = false;
    let mut is_collection = collection_type(&field.ty);
    let mut nested = false;

    for attr in &field.attrs {
        if attr.path().is_ident("serde") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    if let Some(name) = parse_rename(&meta)? {
                        stored_name = name;
                    }
                } else if meta.path.is_ident("skip")
                    || meta.path.is_ident("skip_serializing")
                    || meta.path.is_ident("flatten")
                {
                    skipped = true;
                } else if meta.path.is_ident("with") {
                    let value: LitStr = meta.value()?.parse()?;
                    with_module = Some(value.parse::<Path>()?);
                } else {
                    skip_meta_value(&meta)?;
                }
                Ok(())
            })?;
        } else if attr.path().is_ident("docmapper") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("codec") {
                    codec = Some(meta.value()?.parse::<LitStr>()?);
                } else if meta.path.is_ident("no_codec") {
                    no_codec = true;
                } else if meta.path.is_ident("collection") {
                    is_collection = true;
                } else if meta.path.is_ident("nested") {
                    nested = true;
                } else {
                    return Err(meta.error("unsupported docmapper attribute"));
                }
                Ok(())
            })?;
        }
    }

    if skipped {
        return Ok(None);
    }

    let codec = match (codec, with_module) {
        (Some(name), _) => Some(CodecSource::Named(name)),
        (None, Some(_)) if no_codec => None,
        (None, Some(path)) => Some(CodecSource::Module(path)),
        (None, None) => None,
    };

    Ok(Some(FieldInfo {
        stored_name,
        codec,
        is_collection,
        nested: nested.then(|| element_type(&field.ty).clone()),
    }))
}

/// Takes the serialized name from `rename = "..."` or
/// `rename(serialize = "...")`.
fn parse_rename(meta: &ParseNestedMeta) -> syn::Result<Option<String>> {
    if meta.input.peek(Token![=]) {
        let value: LitStr = meta.value()?.parse()?;
        return Ok(Some(value.value()));
    }

    let mut name = None;
    meta.parse_nested_meta(|inner| {
        let value: LitStr = inner.value()?.parse()?;
        if inner.path.is_ident("serialize") {
            name = Some(value.value());
        }
        Ok(())
    })?;
    Ok(name)
}

fn skip_meta_value(meta: &ParseNestedMeta) -> syn::Result<()> {
    if meta.input.peek(Token![=]) {
        meta.value()?.parse::<Expr>()?;
    } else if meta.input.peek(Paren) {
        meta.parse_nested_meta(|inner| skip_meta_value(&inner))?;
    }
    Ok(())
}

fn field_schema(info: &FieldInfo) -> TokenStream2 {
    let name = &info.stored_name;
    let codec = info.codec.as_ref().map(|codec| match codec {
        CodecSource::Named(name) => quote! { .codec(::docmapper::codec_marker!(#name)) },
        CodecSource::Module(path) => quote! { .codec(#path::MARKER) },
    });
    let collection = info.is_collection.then(|| quote! { .collection() });
    let nested = info.nested.as_ref().map(|ty| {
        quote! { .nested(<#ty as ::docmapper::schema::MappedType>::schema()) }
    });

    quote! {
        .field(#name, ::docmapper::schema::FieldSchema::new() #codec #collection #nested)
    }
}

/// Returns the single generic argument of `ty` when its last path segment is
/// called `wrapper`.
fn generic_argument<'a>(ty: &'a Type, wrapper: &str) -> Option<&'a Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != wrapper {
        return None;
    }
    let PathArguments::AngleBracketed(arguments) = &segment.arguments else {
        return None;
    };

    arguments.args.iter().find_map(|argument| match argument {
        GenericArgument::Type(ty) => Some(ty),
        _ => None,
    })
}

fn collection_type(ty: &Type) -> bool {
    let ty = generic_argument(ty, "Option").unwrap_or(ty);
    COLLECTION_TYPES
        .iter()
        .any(|wrapper| generic_argument(ty, wrapper).is_some())
}

/// Strips `Option` and collection wrappers down to the embedded document type.
fn element_type(ty: &Type) -> &Type {
    let ty = generic_argument(ty, "Option").unwrap_or(ty);
    COLLECTION_TYPES
        .iter()
        .find_map(|wrapper| generic_argument(ty, wrapper))
        .unwrap_or(ty)
}
