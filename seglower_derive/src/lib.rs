use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    Fields, Ident, ItemStruct, Token,
};

struct Traits {
    names: Vec<Ident>,
}

impl Parse for Traits {
    fn parse(input: ParseStream) -> syn::parse::Result<Self> {
        let names = Punctuated::<Ident, Token![,]>::parse_terminated(input)?;
        Ok(Traits {
            names: names.into_iter().collect(),
        })
    }
}

const IGNORE_ATTR_NAME: &str = "span_ignore";

/// Derives `PartialEq`, `Eq` and/or `Hash` for a struct with named fields, skipping every field
/// marked `#[span_ignore]`.
///
/// Descriptors carry source spans for diagnostics. Two descriptors that only differ in where
/// they were written down describe the same operation, so comparisons must not look at spans.
#[proc_macro_attribute]
pub fn span_derive(attr: TokenStream, input: TokenStream) -> TokenStream {
    let traits = parse_macro_input!(attr as Traits);
    let mut item = parse_macro_input!(input as ItemStruct);
    if traits.names.is_empty() {
        return syn::Error::new_spanned(&item.ident, "span_derive needs at least one trait")
            .to_compile_error()
            .into();
    }

    let fields = match &mut item.fields {
        Fields::Named(fields) => fields,
        _ => {
            return syn::Error::new_spanned(
                &item.ident,
                "span_derive is only implemented for structs with named fields",
            )
            .to_compile_error()
            .into()
        }
    };
    // Strip the helper attribute and remember which fields take part in comparisons.
    let mut compared = vec![];
    for field in fields.named.iter_mut() {
        let attr_count = field.attrs.len();
        field
            .attrs
            .retain(|attr| !attr.path.is_ident(IGNORE_ATTR_NAME));
        if field.attrs.len() == attr_count {
            if let Some(ident) = &field.ident {
                compared.push(ident.clone());
            }
        }
    }

    let name = &item.ident;
    let (impl_generics, ty_generics, where_clause) = item.generics.split_for_impl();
    let mut impls = TokenStream2::new();
    for trait_name in traits.names.iter() {
        let impl_code = match trait_name.to_string().as_str() {
            "PartialEq" => quote!(
                impl #impl_generics ::core::cmp::PartialEq for #name #ty_generics #where_clause {
                    fn eq(&self, other: &Self) -> bool {
                        true #(&& self.#compared == other.#compared)*
                    }
                }
            ),
            "Eq" => quote!(
                impl #impl_generics ::core::cmp::Eq for #name #ty_generics #where_clause {}
            ),
            "Hash" => quote!(
                impl #impl_generics ::core::hash::Hash for #name #ty_generics #where_clause {
                    fn hash<H: ::core::hash::Hasher>(&self, state: &mut H) {
                        #(::core::hash::Hash::hash(&self.#compared, state);)*
                    }
                }
            ),
            other => {
                let msg = format!("span_derive not implemented for {}", other);
                syn::Error::new_spanned(trait_name, msg).to_compile_error()
            }
        };
        impls.extend(impl_code);
    }

    TokenStream::from(quote!(
        #item
        #impls
    ))
}
