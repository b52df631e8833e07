use std::{collections::HashSet, error::Error};

use ldap3::LdapConnAsync;

pub const LDAP_URL: &str = "ldap://localhost:1389";
pub const ADMIN_DN: &str = "cn=admin,dc=example,dc=org";
pub const ADMIN_PASSWORD: &str = "adminpassword";

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new(LDAP_URL).await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind(ADMIN_DN, ADMIN_PASSWORD).await?.success()?;
	Ok(ldap)
}

pub async fn add_ou(ldap: &mut ldap3::Ldap, ou: &str) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("ou={ou},dc=example,dc=org"),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn delete_ou(ldap: &mut ldap3::Ldap, ou: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("ou={ou},dc=example,dc=org")).await?.success()?;
	Ok(())
}

pub fn person_dn(uid: &str) -> String {
	format!("uid={uid},ou=People,dc=example,dc=org")
}

pub fn group_dn(cn: &str) -> String {
	format!("cn={cn},ou=Groups,dc=example,dc=org")
}

pub async fn add_person(
	ldap: &mut ldap3::Ldap,
	uid: &str,
	name: &str,
	password: &str,
) -> Result<(), Box<dyn Error>> {
	let mail = format!("{uid}@example.org");
	ldap.add(
		&person_dn(uid),
		vec![
			("objectClass", ["inetOrgPerson"].into()),
			("uid", [uid].into()),
			("cn", [name].into()),
			("sn", [name].into()),
			("mail", [mail.as_str()].into()),
			("userPassword", [password].into()),
		],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn delete_person(ldap: &mut ldap3::Ldap, uid: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&person_dn(uid)).await?.success()?;
	Ok(())
}

pub async fn add_group(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	member_uids: &[&str],
) -> Result<(), Box<dyn Error>> {
	let members: Vec<String> = member_uids.iter().map(|uid| person_dn(uid)).collect();
	let member_refs: HashSet<&str> = members.iter().map(String::as_str).collect();
	ldap.add(
		&group_dn(cn),
		vec![
			("objectClass", ["groupOfNames"].into()),
			("cn", [cn].into()),
			("member", member_refs),
		],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn delete_group(ldap: &mut ldap3::Ldap, cn: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&group_dn(cn)).await?.success()?;
	Ok(())
}

pub async fn replace_attr(
	ldap: &mut ldap3::Ldap,
	dn: &str,
	attribute: &str,
	value: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.modify(dn, vec![ldap3::Mod::Replace(attribute, [value].into())]).await?.success()?;
	Ok(())
}
