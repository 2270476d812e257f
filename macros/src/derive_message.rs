use proc_macro2::Span;
use quote::{quote, ToTokens};
use syn::{
    custom_keyword,
    parse::{Parse, ParseStream},
    spanned::Spanned,
    Data, DeriveInput, Fields, Generics, Ident, Index, LitInt, Member, Token, Type,
};

pub struct DeriveMessage {
    op_code: LitInt,
    pool_flag: Member,
    ident: Ident,
    generics: Generics,
}

impl ToTokens for DeriveMessage {
    fn to_tokens(&self, tokens: &mut proc_macro2::TokenStream) {
        let Self {
            op_code,
            pool_flag,
            ident,
            generics,
        } = self;
        let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

        tokens.extend(quote! {
            #[automatically_derived]
            impl #impl_generics ::shardline::message::Message for #ident #ty_generics #where_clause {
                #[inline]
                fn op_code(&self) -> u32 {
                    #op_code
                }

                #[inline]
                fn pool_flag(&self) -> &::shardline::message::PoolFlag {
                    &self.#pool_flag
                }

                #[inline]
                fn pool_flag_mut(&mut self) -> &mut ::shardline::message::PoolFlag {
                    &mut self.#pool_flag
                }
            }
        });
    }
}

impl Parse for DeriveMessage {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let input: DeriveInput = input.parse()?;
        let span = input.ident.span();

        let mut op_code = None;
        for attr in &input.attrs {
            if attr.path().is_ident("message") {
                if op_code.is_some() {
                    return Err(syn::Error::new(
                        attr.span(),
                        "message attribute already specified",
                    ));
                }
                let MessageAttr { op_code: lit } = attr.parse_args()?;
                // reject literals that don't fit before they reach the generated code
                lit.base10_parse::<u32>()?;
                op_code = Some(lit);
            }
        }
        let op_code = op_code.ok_or_else(|| {
            syn::Error::new(span, "missing #[message(op_code = ...)] attribute")
        })?;

        let fields = match input.data {
            Data::Struct(data) => data.fields,
            Data::Enum(data) => {
                return Err(syn::Error::new(
                    data.enum_token.span,
                    "Message can only be derived for structs",
                ))
            }
            Data::Union(data) => {
                return Err(syn::Error::new(
                    data.union_token.span,
                    "Message can only be derived for structs",
                ))
            }
        };
        let pool_flag = find_pool_flag(&fields, span)?;

        Ok(DeriveMessage {
            op_code,
            pool_flag,
            ident: input.ident,
            generics: input.generics,
        })
    }
}

struct MessageAttr {
    op_code: LitInt,
}

impl Parse for MessageAttr {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let _: op_code = input.parse()?;
        let _: Token![=] = input.parse()?;
        let op_code: LitInt = input.parse()?;
        let _: Option<Token![,]> = input.parse()?;
        Ok(MessageAttr { op_code })
    }
}

custom_keyword!(op_code);
custom_keyword!(pool_flag);

fn find_pool_flag(fields: &Fields, span: Span) -> syn::Result<Member> {
    let mut marked = None;
    let mut by_type = Vec::new();

    for (i, field) in fields.iter().enumerate() {
        let member = match &field.ident {
            Some(ident) => Member::Named(ident.clone()),
            None => Member::Unnamed(Index::from(i)),
        };

        for attr in &field.attrs {
            if attr.path().is_ident("message") {
                let _: pool_flag = attr.parse_args()?;
                if marked.is_some() {
                    return Err(syn::Error::new(
                        attr.span(),
                        "pool_flag already set on another field",
                    ));
                }
                marked = Some(member.clone());
            }
        }

        if is_pool_flag_type(&field.ty) {
            by_type.push(member);
        }
    }

    if let Some(member) = marked {
        return Ok(member);
    }
    match by_type.len() {
        1 => Ok(by_type.remove(0)),
        0 => Err(syn::Error::new(
            span,
            "missing a PoolFlag field; add one and mark it with #[message(pool_flag)]",
        )),
        _ => Err(syn::Error::new(
            span,
            "several PoolFlag fields; mark one with #[message(pool_flag)]",
        )),
    }
}

fn is_pool_flag_type(ty: &Type) -> bool {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "PoolFlag"),
        _ => false,
    }
}
